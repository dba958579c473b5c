use crate::error::AcquireError;
use crate::session::Session;
use std::io::Read;
use std::time::Duration;

/// An opened response body ready to be streamed to disk
pub struct Download {
    pub total: Option<u64>,
    pub body: Box<dyn Read>,
}

/// Trait for fetching demo files to allow mocking in the cache tests
pub trait Transport {
    fn open(&self, url: &str, session: &Session) -> Result<Download, AcquireError>;
}

pub struct HttpTransport {
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout_connect(Duration::from_secs(30))
                .timeout_read(read_timeout)
                .build(),
        }
    }
}

impl Transport for HttpTransport {
    fn open(&self, url: &str, session: &Session) -> Result<Download, AcquireError> {
        let mut req = self.agent.get(url).set("User-Agent", &session.user_agent);
        // Only cookies scoped to the demo host are sent
        if let Some(cookies) = session.cookie_header(url) {
            req = req.set("Cookie", &cookies);
        }

        match req.call() {
            Ok(resp) => {
                let total = resp
                    .header("Content-Length")
                    .and_then(|v| v.trim().parse::<u64>().ok());
                Ok(Download {
                    total,
                    body: Box::new(resp.into_reader()),
                })
            }
            Err(ureq::Error::Status(code, resp)) => Err(AcquireError::download(
                url,
                format!("HTTP {} {}", code, resp.status_text()),
            )),
            Err(e) => Err(AcquireError::download(url, e)),
        }
    }
}
