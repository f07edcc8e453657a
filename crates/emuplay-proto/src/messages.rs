use serde::de::DeserializeOwned;

use crate::msg_id::MsgId;

pub mod input;
pub mod session;
pub mod sync;

/// A netplay protocol message with a fixed [`MsgId`].
pub trait Message: serde::Serialize + DeserializeOwned + Send + 'static {
    fn msg_id() -> MsgId;
}

macro_rules! impl_message {
    ($($ty:ty => $id:ident),* $(,)?) => {
        $(
            impl Message for $ty {
                #[inline]
                fn msg_id() -> MsgId {
                    MsgId::$id
                }
            }
        )*
    };
}

impl_message! {
    session::Hello => Hello,
    session::Welcome => Welcome,
    session::Reject => Reject,
    session::Disconnect => Disconnect,
    sync::Snapshot => Snapshot,
    sync::Ping => Ping,
    sync::Pong => Pong,
    input::InputFrame => InputFrame,
    input::ClientInput => ClientInput,
    input::ResetRequest => ResetRequest,
}
