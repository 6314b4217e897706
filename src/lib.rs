// Module naming follows project convention (capitalised groups, file-per-concern)
#[allow(non_snake_case)]
pub mod Ring {
    pub mod Buffer {
        pub mod Buffer;
        pub mod Buffer_impl;
        pub mod layout;
        pub use Buffer::RingView; // re-export for stable path
    }
    pub mod Structs {
        pub mod Buffer_Structs;
        pub use Buffer_Structs::{DirtyRectMsg, FrameHeader, Message, XferHeader}; // re-export for stable path
    }
}
#[allow(non_snake_case)]
pub mod Core {
    pub mod SharedMemory;
    pub use SharedMemory::{
        attach_shared_memory, create_shared_memory, unlink_shared_memory, HeapMemory, RawHandle,
        SharedMemoryBackend,
    };
    pub mod error;
    pub use error::{BindFailure, MalformedFrame, TransportError};
    pub mod futex;
    pub mod ports;
    pub use ports::{Addr, DomainId, PortClass};
    pub mod registry;
    pub use registry::{Backing, Registry};
    pub mod snapshot;
}
#[allow(non_snake_case)]
pub mod Transport;
#[allow(non_snake_case)]
mod Debug {
    pub mod StructDebug;
}
