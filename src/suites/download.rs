use std::time::Duration;

use crate::{
    error::{HarnessError, Result},
    file_server::{Resource, DEFAULT_BLOCK_SIZE},
    test_case::{TestCase, TestContext, TestFuture},
    time::Deadline,
    transport::TransportConfig,
};

const DOWNLOAD_SIZE: usize = 16 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Plain CoAP download of 16 KiB in 1024-byte blocks.
pub struct CoapDownload;

impl TestCase for CoapDownload {
    fn suite(&self) -> &'static str {
        "download"
    }

    fn name(&self) -> &'static str {
        "coap_16k"
    }

    fn run<'a>(&'a self, ctx: &'a mut TestContext) -> TestFuture<'a> {
        Box::pin(async move {
            let data = pattern(DOWNLOAD_SIZE);
            let uri = {
                let file_server = ctx.start_file_server(TransportConfig::plain()).await?;
                file_server.set_resource("/", Resource::new(data.clone()));
                file_server.uri("/")
            };
            let target = ctx.log_dir().join("downloaded.bin");

            ctx.client()?.download(&uri, &target, None).await?;
            let downloaded = wait_for_file(&target, data.len(), Deadline::after(Duration::from_secs(10))).await?;
            if downloaded != data {
                return Err(HarnessError::assertion("downloaded file differs from the served resource"));
            }

            let served = ctx.file_server(0)?.requests_served();
            let expected = DOWNLOAD_SIZE / DEFAULT_BLOCK_SIZE;
            if served != expected {
                return Err(HarnessError::assertion(format!(
                    "download took {served} requests, expected {expected}"
                )));
            }
            Ok(())
        })
    }
}

async fn wait_for_file(path: &std::path::Path, len: usize, deadline: Deadline) -> Result<Vec<u8>> {
    loop {
        match tokio::fs::read(path).await {
            Ok(content) if content.len() >= len => return Ok(content),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if deadline.is_expired() {
            return Err(HarnessError::assertion(format!(
                "{} did not reach {len} bytes in time",
                path.display()
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let missing = wait_for_file(&path, 1, Deadline::after(Duration::from_millis(150))).await;
        assert!(matches!(missing, Err(HarnessError::Assertion(_))));

        std::fs::write(&path, pattern(300)).unwrap();
        let content = wait_for_file(&path, 300, Deadline::after(Duration::from_secs(1))).await.unwrap();
        assert_eq!(content[250], 250);
        assert_eq!(content[251], 0);
    }
}
