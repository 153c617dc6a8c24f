pub mod close_codes;
pub mod delivery;
pub mod envelope;

pub use delivery::DeliveryState;
pub use envelope::{
    AckPayload, ChatMessagePayload, Envelope, EnvelopeKind, ErrorPayload, HelloPayload,
    OnlineStatusPayload, ReadReceiptPayload, Target, TypingStatusPayload, SERVER_SENDER,
};
