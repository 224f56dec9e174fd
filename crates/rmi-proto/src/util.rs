//! Internal utilities for rmi-proto.

pub(crate) mod err;
