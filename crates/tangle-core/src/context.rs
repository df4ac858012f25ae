//! Request handling context
//!
//! Handlers for inbound requests receive a [`RequestContext`] instead of the
//! raw connection. It enforces the reply contract: at most one reply per
//! request, and deferred work runs only after the reply has left.

use std::sync::Arc;

use crate::connection::Connection;
use crate::cvid::Cvid;
use crate::envelope::{Envelope, Payload};
use crate::error::{NetError, NetResult};

type Deferred = Box<dyn FnOnce() + Send>;

/// Context for one inbound request
pub struct RequestContext {
    connection: Arc<Connection>,
    request: Envelope,
    reply: Option<Payload>,
    deferred: Option<Deferred>,
}

impl RequestContext {
    pub fn new(connection: Arc<Connection>, request: Envelope) -> Self {
        Self {
            connection,
            request,
            reply: None,
            deferred: None,
        }
    }

    /// The request being handled
    pub fn request(&self) -> &Envelope {
        &self.request
    }

    /// The connection the request arrived on
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Stage the reply payload. Fails if a reply was already staged.
    pub fn reply(&mut self, payload: Payload) -> NetResult<()> {
        if self.reply.is_some() {
            return Err(NetError::IllegalState("reply already set".into()));
        }
        self.reply = Some(payload);
        Ok(())
    }

    /// Stage work to run after the reply is sent. Fails if already staged.
    pub fn defer(&mut self, work: Deferred) -> NetResult<()> {
        if self.deferred.is_some() {
            return Err(NetError::IllegalState("deferred action already set".into()));
        }
        self.deferred = Some(work);
        Ok(())
    }

    /// Send the staged reply (if any), then run the deferred action (if any)
    pub fn finish(mut self, local_cvid: Cvid) -> NetResult<()> {
        if let Some(payload) = self.reply.take() {
            let reply = self.request.reply(local_cvid, payload);
            self.connection.send(&reply)?;
        }
        if let Some(work) = self.deferred.take() {
            work();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::sync::mpsc;

    use super::*;
    use crate::envelope::Frame;

    fn outcome(success: bool) -> Payload {
        Payload::Outcome {
            success,
            message: String::new(),
        }
    }

    #[tokio::test]
    async fn test_finish_sends_reply_then_runs_deferred() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection::new(1, "test".into(), tx);
        let request = Envelope::new(100, 200, outcome(true));

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        let mut ctx = RequestContext::new(conn, request.clone());
        ctx.reply(outcome(false)).unwrap();
        ctx.defer(Box::new(move || flag.store(true, Ordering::SeqCst)))
            .unwrap();
        ctx.finish(100).unwrap();

        let sent = Frame::decode(&rx.recv().await.unwrap())
            .unwrap()
            .into_inner();
        assert_eq!(sent.id, request.id);
        assert_eq!(sent.to, request.from);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_double_reply_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Connection::new(1, "test".into(), tx);
        let mut ctx = RequestContext::new(conn, Envelope::new(1, 2, outcome(true)));

        ctx.reply(outcome(true)).unwrap();
        assert!(matches!(
            ctx.reply(outcome(true)),
            Err(NetError::IllegalState(_))
        ));
    }

    #[test]
    fn test_double_defer_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Connection::new(1, "test".into(), tx);
        let mut ctx = RequestContext::new(conn, Envelope::new(1, 2, outcome(true)));

        ctx.defer(Box::new(|| {})).unwrap();
        assert!(matches!(
            ctx.defer(Box::new(|| {})),
            Err(NetError::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn test_finish_without_reply_sends_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection::new(1, "test".into(), tx);
        let ctx = RequestContext::new(conn, Envelope::new(1, 2, outcome(true)));
        ctx.finish(100).unwrap();
        assert!(rx.try_recv().is_err());
    }
}
