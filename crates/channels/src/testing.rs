#![allow(clippy::unwrap_used)]

use std::sync::Mutex;

use async_trait::async_trait;

use crate::event::{ChannelEvent, ChannelEventSink, InboundMessage};

/// Event sink that keeps everything it receives.
#[derive(Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<ChannelEvent>>,
    inbound: Mutex<Vec<InboundMessage>>,
}

impl RecordingSink {
    pub(crate) fn events(&self) -> Vec<ChannelEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn inbound(&self) -> Vec<InboundMessage> {
        self.inbound.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelEventSink for RecordingSink {
    async fn emit(&self, event: ChannelEvent) {
        self.events.lock().unwrap().push(event);
    }

    async fn dispatch_inbound(&self, message: InboundMessage) {
        self.inbound.lock().unwrap().push(message);
    }
}
