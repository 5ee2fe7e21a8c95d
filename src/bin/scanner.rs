//! Door scanner: one identifier per line on stdin, one feedback line out.

use std::error::Error;

use dotenvy::dotenv;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};

use admission_server::config::ScannerConfig;
use admission_server::init_tracing;
use admission_server::scanner::{
    HttpAdmissionClient, RetryPolicy, ScanSession, ScanSessionConfig, Signal,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();
    init_tracing("admission_server=info,scanner=info");

    let config = ScannerConfig::from_env()?;
    let client = HttpAdmissionClient::new(&config.api_url, config.request_timeout)?;
    tracing::info!(
        scanner_id = %config.scanner_id,
        endpoint = client.endpoint(),
        "Scanner ready"
    );

    let session = ScanSession::new(
        client,
        ScanSessionConfig {
            local_window: config.local_window,
            retry: RetryPolicy::default().with_max_retries(config.max_retries),
            ..ScanSessionConfig::new(config.scanner_id)
        },
    );

    let mut lines = BufReader::new(stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let feedback = session.scan(&line).await;
        let cue = match feedback.signal() {
            Signal::GreenChime => "[green, chime]",
            Signal::AmberChime => "[amber, chime]",
            Signal::RedBuzz => "[red, buzz]",
            Signal::None => continue,
        };
        println!("{cue} {feedback}");
    }

    Ok(())
}
