//! TLS key logging in the NSS key log format.
//!
//! Each secret is written as one line, `LABEL <client_random> <secret>`, with both
//! values hex encoded. Tools such as Wireshark read these files to decrypt captured
//! traffic.

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, Write as _};

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::transport::TlsSecret;

/// Environment variable naming the key log file.
pub const SSLKEYLOGFILE: &str = "SSLKEYLOGFILE";

/// Appends TLS secrets to a key log file.
///
/// The file is opened lazily on the first write, in append mode, so several
/// connections (or processes) can share one file.
#[derive(Debug)]
pub struct KeyLogFile {
    path: Utf8PathBuf,
    file: Mutex<Option<File>>,
}

impl KeyLogFile {
    /// Log to `path`.
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    /// Log to the file named by `SSLKEYLOGFILE`, if it is set and not empty.
    pub fn from_env() -> Option<Self> {
        let path = std::env::var(SSLKEYLOGFILE).ok()?;
        if path.is_empty() {
            return None;
        }
        Some(Self::new(path))
    }

    /// The file secrets are written to.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Append `secrets`, one line each.
    pub fn write(&self, secrets: &[TlsSecret]) -> io::Result<()> {
        if secrets.is_empty() {
            return Ok(());
        }

        let mut lines = String::new();
        for secret in secrets {
            lines.push_str(&secret.label);
            lines.push(' ');
            hex(&mut lines, &secret.client_random);
            lines.push(' ');
            hex(&mut lines, &secret.secret);
            lines.push('\n');
        }

        let mut guard = self.file.lock();
        if guard.is_none() {
            trace!(path = %self.path, "opening key log");
            *guard = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?,
            );
        }

        let Some(file) = guard.as_mut() else {
            return Ok(());
        };

        if let Err(error) = file.write_all(lines.as_bytes()).and_then(|_| file.flush()) {
            warn!(path = %self.path, "key log write failed: {error}");
            *guard = None;
            return Err(error);
        }
        Ok(())
    }
}

fn hex(out: &mut String, bytes: &[u8]) {
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
}
