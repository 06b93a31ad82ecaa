//! Shared fixtures for integration tests
#![allow(dead_code)]

use mailsync::config::{Account, AccountSettings, Config, Identity};
use mailsync::delta::DeltaStream;
use mailsync::store::MailStore;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;

pub struct CapturedOutput(pub Arc<Mutex<Vec<u8>>>);

struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl CapturedOutput {
    /// All deltas written so far, one JSON value per line, after forcing a
    /// flush of the stream buffer.
    pub fn deltas(&self, stream: &DeltaStream) -> Vec<serde_json::Value> {
        stream.flush_buffer();
        String::from_utf8(self.0.lock().clone())
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    pub fn deltas_of_type(
        &self,
        stream: &DeltaStream,
        delta_type: &str,
        model_class: &str,
    ) -> Vec<serde_json::Value> {
        self.deltas(stream)
            .into_iter()
            .filter(|d| d["type"] == delta_type && d["objectClass"] == model_class)
            .collect()
    }
}

pub async fn open_store(dir: &tempfile::TempDir) -> (Arc<MailStore>, Arc<DeltaStream>, CapturedOutput) {
    let sink = Arc::new(Mutex::new(Vec::new()));
    let stream = DeltaStream::new(Box::new(SharedSink(sink.clone())));
    let store = MailStore::open(&dir.path().join("test.db"), stream.clone())
        .await
        .unwrap();
    (store, stream, CapturedOutput(sink))
}

pub fn account() -> Arc<Account> {
    Arc::new(Account {
        id: "acct-1".to_string(),
        provider: "imap".to_string(),
        email_address: "user@example.com".to_string(),
        settings: AccountSettings {
            imap_host: "imap.example.com".to_string(),
            imap_port: 993,
            imap_username: "user@example.com".to_string(),
            imap_password: "secret".to_string(),
            smtp_host: "smtp.example.com".to_string(),
            smtp_port: 465,
            smtp_username: "user@example.com".to_string(),
            smtp_password: "secret".to_string(),
            ..Default::default()
        },
        container_folder: None,
    })
}

pub fn config(dir: &tempfile::TempDir) -> Arc<Config> {
    Arc::new(Config {
        config_dir: dir.path().to_path_buf(),
        identity_server: "https://id.example.com".to_string(),
    })
}

pub fn identity() -> Identity {
    Identity {
        id: "ident-1".to_string(),
        token: "token".to_string(),
    }
}
