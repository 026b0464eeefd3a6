//! Handler for asynchronous server messages.

use crate::state::action::AsyncMessage;

/// Receives notices, notifications and parameter changes.
///
/// Messages can arrive between any two protocol messages, including in
/// the middle of a result set. The handler runs inline on the connection,
/// so it must not block.
///
/// Any `FnMut(&AsyncMessage) + Send` closure is a handler:
///
/// ```
/// use zero_gauss::AsyncMessage;
/// use zero_gauss::handler::AsyncMessageHandler;
///
/// let mut seen = Vec::new();
/// let mut handler = |msg: &AsyncMessage| {
///     if let AsyncMessage::Notification { channel, .. } = msg {
///         seen.push(channel.clone());
///     }
/// };
/// handler.handle(&AsyncMessage::Notification {
///     pid: 1,
///     channel: "jobs".into(),
///     payload: String::new(),
/// });
/// assert_eq!(seen, ["jobs"]);
/// ```
pub trait AsyncMessageHandler: Send {
    fn handle(&mut self, msg: &AsyncMessage);
}

impl<F: FnMut(&AsyncMessage) + Send> AsyncMessageHandler for F {
    fn handle(&mut self, msg: &AsyncMessage) {
        self(msg)
    }
}

/// Collects every message it receives.
#[derive(Debug, Default)]
pub struct CollectMessages {
    messages: std::sync::Arc<std::sync::Mutex<Vec<AsyncMessage>>>,
}

impl CollectMessages {
    pub fn new() -> Self {
        Self::default()
    }

    /// A second handle on the same message list.
    ///
    /// Install one handle on the connection and keep the other to read.
    pub fn share(&self) -> Self {
        Self {
            messages: std::sync::Arc::clone(&self.messages),
        }
    }

    /// Remove and return the messages collected so far.
    pub fn take(&self) -> Vec<AsyncMessage> {
        match self.messages.lock() {
            Ok(mut messages) => std::mem::take(&mut *messages),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl AsyncMessageHandler for CollectMessages {
    fn handle(&mut self, msg: &AsyncMessage) {
        match self.messages.lock() {
            Ok(mut messages) => messages.push(msg.clone()),
            Err(poisoned) => poisoned.into_inner().push(msg.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_messages() {
        let reader = CollectMessages::new();
        let mut writer = reader.share();
        writer.handle(&AsyncMessage::ParameterChanged {
            name: "TimeZone".into(),
            value: "UTC".into(),
        });
        let taken = reader.take();
        assert_eq!(taken.len(), 1);
        assert!(matches!(&taken[0], AsyncMessage::ParameterChanged { name, .. } if name == "TimeZone"));
        assert!(reader.take().is_empty());
    }

    #[test]
    fn test_closure_handler() {
        let mut count = 0;
        {
            let mut handler = |_: &AsyncMessage| count += 1;
            let boxed: &mut dyn AsyncMessageHandler = &mut handler;
            boxed.handle(&AsyncMessage::ParameterChanged {
                name: "a".into(),
                value: "b".into(),
            });
        }
        assert_eq!(count, 1);
    }
}
