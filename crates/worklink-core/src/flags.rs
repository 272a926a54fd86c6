//! Frame flags.

use bitflags::bitflags;

bitflags! {
    /// Flags carried in each frame descriptor.
    ///
    /// Receivers ignore unknown bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u32 {
        /// Outbound call; `channel_id` holds the call identifier.
        const REQUEST  = 0b0000_0001;

        /// Reply to a call; `channel_id` echoes the request's call identifier.
        const RESPONSE = 0b0000_0010;

        /// Controller-initiated event, routed through the dispatcher.
        const EVENT    = 0b0000_0100;

        /// Session-level message (handshake, terminate).
        const CONTROL  = 0b0000_1000;

        /// Payload is an error (`code | len | message`).
        const ERROR    = 0b0001_0000;
    }
}
