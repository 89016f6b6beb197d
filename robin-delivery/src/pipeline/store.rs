//! Local disk persistence for accepted envelopes.
//!
//! The file is created once per envelope under `store_path/tmp/` with a
//! Received header prepended; subsequent processors and the queue read that
//! path. An `X-Robin-Filename` header renames the file before further
//! processing, overwriting any previous file of that name.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;

use robin_common::{
    envelope::{MailData, HEADER_FILENAME},
    session::Session,
};

use super::{Processor, ProcessorError, ProcessorVerdict};

#[derive(Clone, Debug)]
pub struct StoreParams {
    pub store_path: PathBuf,
    pub hostname: String,
}

fn received_header(session: &Session, hostname: &str) -> String {
    let helo = session.ehlo().unwrap_or("unknown");
    let rdns = session.rdns().unwrap_or("unknown");
    let peer = session
        .peer()
        .map_or_else(|| "unknown".to_string(), |peer| peer.ip().to_string());

    format!(
        "Received: from {helo} ({rdns} [{peer}])\r\n\tby {hostname} with ESMTP id {uid};\r\n\t{date}\r\n",
        uid = session.uid(),
        date = Utc::now().to_rfc2822(),
    )
}

/// Keeps a configured filename from escaping the store directory.
fn sanitize_filename(name: &str) -> Option<String> {
    let name = name.trim();
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
    {
        return None;
    }
    Some(name.to_string())
}

/// Writes the envelope file if it does not exist yet and returns its path.
///
/// Honours `X-Robin-Filename`; callers further down the chain see the final
/// name. Idempotent per envelope.
pub async fn ensure_stored(
    session: &mut Session,
    data: &[u8],
    params: &StoreParams,
) -> Result<PathBuf, ProcessorError> {
    let header = received_header(session, &params.hostname);
    let uid = session.uid().as_str().to_string();

    let Some(envelope) = session.current_envelope_mut() else {
        return Err(ProcessorError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no open envelope to store",
        )));
    };

    if let Some(existing) = envelope.file_path() {
        return Ok(existing.clone());
    }

    let directory = params.store_path.join("tmp");
    tokio::fs::create_dir_all(&directory).await?;

    let name = envelope
        .header(HEADER_FILENAME)
        .and_then(sanitize_filename)
        .unwrap_or_else(|| format!("{}-{uid}.eml", Utc::now().format("%Y%m%d")));

    let path = directory.join(name);
    let staging = directory.join(format!(".{uid}.tmp"));

    let mut contents = Vec::with_capacity(header.len() + data.len());
    contents.extend_from_slice(header.as_bytes());
    contents.extend_from_slice(data);

    tokio::fs::write(&staging, &contents).await?;
    tokio::fs::rename(&staging, &path).await?;

    envelope.set_data(MailData::File(path.clone()));
    tracing::debug!(path = %path.display(), "envelope stored");

    Ok(path)
}

/// Deletes a stored envelope file, tolerating it being gone already.
pub async fn remove_stored(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await {
        if error.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), %error, "unable to remove stored file");
        }
    }
}

/// The terminal pipeline stage: persists the message to disk.
#[derive(Debug)]
pub struct StoreProcessor {
    params: StoreParams,
}

impl StoreProcessor {
    #[must_use]
    pub const fn new(params: StoreParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Processor for StoreProcessor {
    fn name(&self) -> &'static str {
        "store"
    }

    async fn process(
        &self,
        session: &mut Session,
        data: &[u8],
    ) -> Result<ProcessorVerdict, ProcessorError> {
        ensure_stored(session, data, &self.params).await?;
        Ok(ProcessorVerdict::Continue)
    }
}
