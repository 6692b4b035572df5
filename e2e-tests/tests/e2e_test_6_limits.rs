// End-to-end: resource-exhaustion limits answer 421 and close.

mod e2e;

use e2e::helpers::TestServer;
use e2e::smtp_client::SmtpTestClient;

#[tokio::test]
async fn test_error_limit_closes_with_421() {
    let env = TestServer::start(|_| {}).await;
    let mut client = SmtpTestClient::connect(env.plain).await.unwrap();

    // Default error limit is 3: three garbage commands earn 500s, the
    // fourth crosses the limit and earns the closing 421.
    for _ in 0..3 {
        let reply = client.command("GARBAGE NONSENSE").await.unwrap();
        assert!(reply.starts_with("500"), "garbage reply: {}", reply);
    }

    let reply = client.command("GARBAGE NONSENSE").await.unwrap();
    assert!(reply.starts_with("421"), "limit reply: {}", reply);

    // The server closed the connection after the 421.
    client.send_line("NOOP").await.ok();
    assert!(client.read_response().await.is_err());

    env.server.stop().await;
}

#[tokio::test]
async fn test_transaction_limit_closes_with_421() {
    let env = TestServer::start(|config| {
        config.smtp.transactions_limit = 5;
    })
    .await;
    let mut client = SmtpTestClient::connect(env.plain).await.unwrap();

    client.command("HELO mx.test").await.unwrap();
    let mut last = String::new();
    for _ in 0..5 {
        last = client.command("NOOP").await.unwrap();
        if last.starts_with("421") {
            break;
        }
    }
    assert!(last.starts_with("421"), "limit reply: {}", last);

    env.server.stop().await;
}

#[tokio::test]
async fn test_sequence_violations_count_toward_limit() {
    let env = TestServer::start(|config| {
        config.smtp.error_limit = 2;
    })
    .await;
    let mut client = SmtpTestClient::connect(env.plain).await.unwrap();

    // DATA before any greeting/envelope is a 503 each time.
    let reply = client.command("DATA").await.unwrap();
    assert!(reply.starts_with("503"), "DATA reply: {}", reply);
    let reply = client.command("DATA").await.unwrap();
    assert!(reply.starts_with("503"), "DATA reply: {}", reply);

    let reply = client.command("DATA").await.unwrap();
    assert!(reply.starts_with("421"), "limit reply: {}", reply);

    env.server.stop().await;
}
