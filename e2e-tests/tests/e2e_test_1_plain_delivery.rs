// End-to-end: one plain HELO delivery, asserted down to the transaction log
// and the stored file.

mod e2e;

use e2e::helpers::TestServer;
use e2e::smtp_client::SmtpTestClient;
use robin_rs::smtp::SmtpVerb;

#[tokio::test]
async fn test_plain_delivery() {
    let env = TestServer::start(|_| {}).await;
    let mut client = SmtpTestClient::connect(env.plain).await.unwrap();

    let reply = client.command("HELO mx.test").await.unwrap();
    assert!(reply.starts_with("250"), "HELO reply: {}", reply);

    let reply = client.command("MAIL FROM:<a@b>").await.unwrap();
    assert!(reply.starts_with("250"), "MAIL reply: {}", reply);

    let reply = client.command("RCPT TO:<c@d>").await.unwrap();
    assert!(reply.starts_with("250"), "RCPT reply: {}", reply);

    let reply = client.data("Subject: x\r\n\r\nhello").await.unwrap();
    assert!(reply.starts_with("250"), "DATA reply: {}", reply);

    let reply = client.quit().await.unwrap();
    assert!(reply.starts_with("221"), "QUIT reply: {}", reply);

    let record = env
        .wait_for_record(|r| matches!(&r.identity, Some((_, id)) if id == "mx.test"))
        .await;

    let verbs: Vec<SmtpVerb> = record.log.all().iter().map(|t| t.verb).collect();
    assert_eq!(
        verbs,
        vec![
            SmtpVerb::Smtp,
            SmtpVerb::Helo,
            SmtpVerb::Mail,
            SmtpVerb::Rcpt,
            SmtpVerb::Data,
            SmtpVerb::Quit,
        ]
    );
    assert!(record.log.errors().is_empty());

    assert_eq!(record.envelopes.len(), 1);
    let envelope = &record.envelopes[0];
    assert_eq!(envelope.sender, "a@b");
    assert_eq!(envelope.recipients, vec!["c@d".to_string()]);

    let stored = envelope.stored_path.as_ref().expect("stored file");
    let contents = tokio::fs::read(stored).await.unwrap();
    assert!(contents.ends_with(b"hello\r\n"));
    assert!(stored.starts_with(env.storage.path()));

    env.server.stop().await;
}

#[tokio::test]
async fn test_rset_opens_fresh_envelope() {
    let env = TestServer::start(|_| {}).await;
    let mut client = SmtpTestClient::connect(env.plain).await.unwrap();

    client.command("HELO mx.test").await.unwrap();
    client.command("MAIL FROM:<a@b>").await.unwrap();
    client.command("RCPT TO:<dropped@d>").await.unwrap();

    let reply = client.command("RSET").await.unwrap();
    assert!(reply.starts_with("250"));

    client.command("MAIL FROM:<second@b>").await.unwrap();
    client.command("RCPT TO:<kept@d>").await.unwrap();
    client.data("Subject: rset\r\n\r\nbody").await.unwrap();
    client.quit().await.unwrap();

    let record = env
        .wait_for_record(|r| matches!(&r.identity, Some((_, id)) if id == "mx.test"))
        .await;
    assert_eq!(record.envelopes.len(), 1);
    assert_eq!(record.envelopes[0].sender, "second@b");
    assert_eq!(record.envelopes[0].recipients, vec!["kept@d".to_string()]);

    env.server.stop().await;
}
