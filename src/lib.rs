//! Game-server supervision core: a framed IPC process supervisor
//! (`framer`/`protocol`/`process`/`lifecycle`/`supervisor`) plus an
//! independent concurrent capacity reservation allocator (`reservation`).

pub mod argv;
pub mod config;
pub mod error;
pub mod framer;
pub mod lifecycle;
pub mod process;
pub mod protocol;
pub mod reservation;
pub mod supervisor;
