use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{
    error::{AuthError, AuthResult},
    notify::{MailTransport, OutboundMail},
    profile::images::{FetchedImage, RemoteImageSource},
};

type ErrorFactory = Box<dyn Fn() -> AuthError + Send + Sync>;

/// Remote image source that serves a fixed body and counts calls.
pub struct StubImageSource {
    body: Bytes,
    content_type: String,
    calls: AtomicUsize,
    failure: Mutex<Option<ErrorFactory>>,
}

impl StubImageSource {
    pub fn new(body: impl Into<Bytes>, content_type: &str) -> Self {
        Self {
            body: body.into(),
            content_type: content_type.to_string(),
            calls: AtomicUsize::new(0),
            failure: Mutex::new(None),
        }
    }

    pub fn png() -> Self {
        Self::new(Bytes::from_static(b"\x89PNG\r\n\x1a\nstub"), "image/png")
    }

    pub fn fail_with(&self, f: impl Fn() -> AuthError + Send + Sync + 'static) {
        *self.failure.lock().unwrap() = Some(Box::new(f));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteImageSource for StubImageSource {
    async fn fetch(&self, _url: &str) -> AuthResult<FetchedImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(make) = self.failure.lock().unwrap().as_ref() {
            return Err(make());
        }
        Ok(FetchedImage {
            body: self.body.clone(),
            content_type: self.content_type.clone(),
        })
    }
}

/// Forwards every delivered message into a channel.
pub struct RecordingMailer {
    tx: mpsc::UnboundedSender<OutboundMail>,
}

impl RecordingMailer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundMail>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MailTransport for RecordingMailer {
    async fn deliver(&self, mail: OutboundMail) -> anyhow::Result<()> {
        self.tx
            .send(mail)
            .map_err(|_| anyhow::anyhow!("recording mailer closed"))
    }
}
