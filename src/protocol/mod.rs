//! Link-layer and tunnel header parsing used by the capture backends

pub mod ethernet;
pub mod vxlan;
