//! Transfer engine.
//!
//! Thread-per-connection pipeline: Generator -> WorkQueue -> SendWorkers
//! -> network -> RecvWorkers -> (destination file | cache block -> MergeEngine)
//!
//! # Architecture
//!
//! ```text
//! +-----------+     +-----------+     +------------+     +-------------+
//! | Generator | --> | WorkQueue | --> | SendWorker | ==> | RecvWorker  |
//! | (scan,    |     | (bounded, |     |  x N       |     |  x N        |
//! |  split)   |     |  join)    |     +------------+     +-------------+
//! +-----------+     +-----------+                          |   split /
//!                                                          v   block_end
//!                                    control conn   +-------------+
//!                                    (stop_fm) ---> | MergeEngine |
//!                                                   | one thread  |
//!                                                   | per split   |
//!                                                   +-------------+
//! ```
//!
//! Each data connection carries one unit at a time: header, raw payload
//! frames, then a heartbeat back from the receiver.

pub mod channel;
pub mod codec;
pub mod generator;
pub mod merge;
pub mod pipeline;
pub mod protocol;
pub mod receiver;
pub mod sender;

pub use channel::{SourceHandle, TransferUnit, WorkQueue, READ_CHUNK_SIZE, WORK_QUEUE_SIZE};
pub use codec::{Base64Codec, Codec};
pub use generator::{Generator, GeneratorConfig, GeneratorStats, TaskConfig, TaskKind};
pub use merge::{MergeEngine, MergeStats};
pub use pipeline::{RecvReport, RecvSession, SendReport, SendSession};
pub use protocol::{
    ErrorPolicy, Format, Message, Packer, PacketError, TaskAnnounce, HEARTBEAT, MAX_FRAME_SIZE,
    SEND_CHUNK_SIZE,
};
pub use receiver::{validate_path, RecvStats, RecvWorker};
pub use sender::{SendStats, SendWorker};
