pub mod entry;

mod error;
mod mountns;

#[cfg(target_os = "linux")]
mod linux {
    mod access;
    pub mod entry;
    mod image;
    mod nspawn;
    mod privilege;
    mod running;
    mod scratch;
    mod session;
    mod sync;
    mod system;
}

#[macro_use]
mod log;
