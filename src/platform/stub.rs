//! Backend for targets without a native hook implementation.

use crate::enforcer::{PointerControl, WindowHost};
use crate::engine::Backend;
use crate::error::{InstallError, InstallFailure};
use crate::event::{Point, Rect};
use crate::hook::{HookCallback, HookDescriptor, HookRegistry, HookToken};
use crate::permission::PermissionProbe;
use crate::schedule::TokioScheduler;
use std::io;
use std::rc::Rc;

pub struct StubRegistry;

impl HookRegistry for StubRegistry {
    fn register_hook(
        &self,
        descriptor: &HookDescriptor,
        _callback: HookCallback,
    ) -> Result<HookToken, InstallError> {
        Err(InstallError::new(
            descriptor.layer,
            descriptor.placement,
            InstallFailure::Unsupported,
        ))
    }

    fn set_enabled(&self, _token: HookToken, _enabled: bool) -> Result<(), InstallError> {
        Ok(())
    }

    fn invalidate(&self, _token: HookToken) {}
}

pub struct StubWindow;

impl WindowHost for StubWindow {
    fn is_focused(&self) -> bool {
        true
    }

    fn bring_to_front(&self) {}

    fn window_origin(&self) -> Point {
        Point::default()
    }

    fn anchor_rect(&self) -> Rect {
        Rect::default()
    }
}

pub struct StubPointer;

impl PointerControl for StubPointer {
    fn position(&self) -> Option<Point> {
        None
    }

    fn warp(&self, _to: Point) -> bool {
        false
    }
}

/// No permission model to consult.
pub struct StubPermission;

impl PermissionProbe for StubPermission {
    fn is_trusted(&self) -> bool {
        true
    }

    fn request_permission(&self) {
        log::info!("No input permission to request on this platform");
    }
}

pub fn native_backend() -> io::Result<Backend> {
    log::warn!("No native input hooks on this platform; locks will be unprotected");
    Ok(Backend {
        registry: Rc::new(StubRegistry),
        window: Rc::new(StubWindow),
        pointer: Rc::new(StubPointer),
        permission: Rc::new(StubPermission),
        scheduler: Rc::new(TokioScheduler),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventMask, Verdict};
    use crate::hook::{LayerId, Placement, TapMode};
    use std::sync::Arc;

    #[test]
    fn every_install_is_unsupported() {
        let descriptor = HookDescriptor::new(
            LayerId::KeyboardHardware,
            EventMask::KEYBOARD,
            Placement::HidTap,
            TapMode::Capture,
        );
        let err = StubRegistry
            .register_hook(&descriptor, Arc::new(|_| Verdict::Pass))
            .unwrap_err();
        assert_eq!(err.reason, InstallFailure::Unsupported);
        assert_eq!(err.layer, LayerId::KeyboardHardware);
    }
}
