//! Post-decode message selection helpers.

use crate::message::{GameEventMessage, Message, SegmentType};

/// Select game event messages whose opcode appears in `opcodes`.
pub fn filter_opcodes<'a>(messages: &'a [Message], opcodes: &[u16]) -> Vec<&'a GameEventMessage> {
    messages
        .iter()
        .filter_map(|message| match message {
            Message::GameEvent(event) if opcodes.contains(&event.opcode) => Some(event),
            _ => None,
        })
        .collect()
}

/// Select messages whose segment type appears in `segments`.
pub fn filter_segments<'a>(messages: &'a [Message], segments: &[SegmentType]) -> Vec<&'a Message> {
    messages
        .iter()
        .filter(|message| segments.contains(&message.segment()))
        .collect()
}
