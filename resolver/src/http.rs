use std::{
    io,
    sync::{Arc, OnceLock},
    time::Duration,
};

use futures::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use url::Url;

use super::{Error, atomic::AtomicFile};

#[derive(Clone, Debug)]
pub struct HttpSource {
    client: Arc<OnceLock<reqwest::Client>>,
    options: HttpOptions,
}

impl HttpSource {
    pub fn new() -> Self {
        Self::with_options(HttpOptions::default())
    }

    pub fn with_options(options: HttpOptions) -> Self {
        Self {
            client: Arc::new(OnceLock::new()),
            options,
        }
    }

    #[allow(clippy::result_large_err)]
    fn client(&self) -> Result<&reqwest::Client, Error> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let mut builder = reqwest::Client::builder().connect_timeout(self.options.connect_timeout);
        if let Some(read_timeout) = self.options.read_timeout {
            builder = builder.read_timeout(read_timeout);
        }
        let client = builder.build()?;
        Ok(self.client.get_or_init(|| client))
    }

    /// Fetches a small text document (a checksum list) under a request deadline and a body
    /// size limit.
    pub(super) async fn get_text(
        &self,
        url: &Url,
        timeout: Duration,
        max_body_bytes: usize,
    ) -> Result<String, Error> {
        let res = self
            .client()?
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(Error::Status {
                url: url.clone(),
                status: res.status().as_u16(),
            });
        }

        if let Some(content_length) = res.content_length()
            && content_length > max_body_bytes as u64
        {
            return Err(Error::ResponseTooLarge {
                url: url.clone(),
                size: content_length,
                max_bytes: max_body_bytes,
            });
        }

        let mut body = Vec::new();
        let mut stream = res.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if body.len() + chunk.len() > max_body_bytes {
                return Err(Error::ResponseTooLarge {
                    url: url.clone(),
                    size: (body.len() + chunk.len()) as u64,
                    max_bytes: max_body_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        String::from_utf8(body)
            .map_err(|err| Error::Io(io::Error::new(io::ErrorKind::InvalidData, err)))
    }

    /// Remote size from a `HEAD` request, if the server reports one.
    pub(super) async fn content_length(&self, url: &Url) -> Option<u64> {
        let res = self.client().ok()?.head(url.clone()).send().await.ok()?;
        if !res.status().is_success() {
            return None;
        }
        // HEAD responses have no body, so read the header instead of the body size hint.
        res.headers()
            .get(CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    /// Streams the body of `url` into `out`.
    pub(super) async fn download(&self, url: &Url, out: &mut AtomicFile) -> Result<u64, Error> {
        let res = self.client()?.get(url.clone()).send().await?;
        if !res.status().is_success() {
            return Err(Error::Status {
                url: url.clone(),
                status: res.status().as_u16(),
            });
        }

        let mut written = 0u64;
        let mut stream = res.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            out.write(&chunk).await?;
            written += chunk.len() as u64;
        }
        Ok(written)
    }
}

impl Default for HttpSource {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct HttpOptions {
    pub connect_timeout: Duration,
    /// Idle timeout between body reads. Payload transfers have no overall deadline here; the
    /// caller bounds the whole resolution instead.
    pub read_timeout: Option<Duration>,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Some(Duration::from_secs(60)),
        }
    }
}
