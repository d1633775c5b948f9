#[cfg(unix)]
pub use self::unix::{
    available,
    await_readable,
    await_writable,
    connect_probe,
    interface_addresses,
    reverse_lookup,
    ConnectProbe,
};

#[cfg(unix)]
mod unix;
