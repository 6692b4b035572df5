pub mod helpers;
pub mod smtp_client;
