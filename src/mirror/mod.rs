pub mod launcher;
pub mod options;

pub use launcher::{
    launch_mirror, verify_reachable, AutoMirrorHandler, LogHandler, MirrorExit, MirrorOutcome,
};
pub use options::MirrorOptions;
