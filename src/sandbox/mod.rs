//! Isolation layer: origin separation, restriction policy and the relay
//! between host and guest.

pub(crate) mod csp;
pub(crate) mod frame;
pub(crate) mod origin;
pub(crate) mod outer_frame;
pub(crate) mod proxy;

pub(crate) use csp::{CspMode, CspViolation, WidgetCsp, WidgetPermissions};
pub(crate) use origin::OriginResolver;
pub(crate) use outer_frame::{FrameEvent, FramePort, OuterFrameController};
pub(crate) use proxy::{GuestRegistry, SandboxResource};
