use strum::FromRepr;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum MsgId {
    Hello = 1,
    Welcome = 2,
    Reject = 3,
    Disconnect = 4,

    Snapshot = 10,

    InputFrame = 20,
    ClientInput = 21,
    ResetRequest = 22,

    Ping = 30,
    Pong = 31,
}
