//! Pointer interceptor: four independent blocking layers.
//!
//! No single interception mechanism has proven complete across every
//! hardware and driver combination, so pointer locks stack:
//!
//! 1. device capture: exclusive seizure of the physical pointing device;
//! 2. event tap: movement, click, scroll and tablet events, HID placement
//!    first and session placement if the HID tap cannot be created;
//! 3. gesture monitor: multi-touch gestures the tap mask misses on some
//!    trackpads;
//! 4. scroll tap: scroll events only, because some drivers route scrolling
//!    around the generic tap.
//!
//! Layers are purely additive: an event is blocked if any active layer
//! blocks it. A layer failing to install is logged and skipped; activation
//! itself never fails.

use crate::error::{HookError, InstallError, InstallFailure};
use crate::event::{EventMask, InputEvent, Verdict};
use crate::hook::{
    Coverage, HookCallback, HookDescriptor, HookHandle, HookLifecycle, HookRegistry, LayerId,
    LayerOutcome, LayerStatus, Placement, TapMode,
};
use crate::state::LockFlagsReader;
use std::rc::Rc;
use std::sync::Arc;

const DEVICE_CAPTURE: &[HookDescriptor] = &[HookDescriptor::new(
    LayerId::PointerDeviceCapture,
    EventMask::POINTER,
    Placement::DeviceSeize,
    TapMode::Capture,
)];

const EVENT_TAP: &[HookDescriptor] = &[
    HookDescriptor::new(
        LayerId::PointerEventTap,
        EventMask::POINTER,
        Placement::HidTap,
        TapMode::Capture,
    ),
    HookDescriptor::new(
        LayerId::PointerEventTap,
        EventMask::POINTER,
        Placement::SessionTap,
        TapMode::Capture,
    ),
];

const GESTURE_MONITOR: &[HookDescriptor] = &[HookDescriptor::new(
    LayerId::PointerGestureMonitor,
    EventMask::GESTURE,
    Placement::AppMonitor,
    TapMode::Capture,
)];

const SCROLL_TAP: &[HookDescriptor] = &[HookDescriptor::new(
    LayerId::PointerScrollTap,
    EventMask::SCROLL,
    Placement::AnnotatedSessionTap,
    TapMode::Capture,
)];

/// Layers in activation order, each with its placements in fallback order.
pub const LAYERS: [&[HookDescriptor]; 4] =
    [DEVICE_CAPTURE, EVENT_TAP, GESTURE_MONITOR, SCROLL_TAP];

/// Swallow anything in `mask` while the pointer is locked.
pub fn pointer_verdict(flags: &LockFlagsReader, mask: EventMask, event: &InputEvent) -> Verdict {
    if flags.pointer_locked() && mask.contains(event.kind) {
        Verdict::Swallow
    } else {
        Verdict::Pass
    }
}

/// Result of [`PointerInterceptor::activate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerActivation {
    pub layers: Vec<LayerOutcome>,
    pub coverage: Coverage,
}

struct PointerLayer {
    candidates: &'static [HookDescriptor],
    handle: Option<HookHandle>,
}

impl PointerLayer {
    fn layer(&self) -> LayerId {
        self.candidates[0].layer
    }

    /// Tries each placement in order until one installs and enables.
    fn bring_up(
        &mut self,
        registry: &Rc<dyn HookRegistry>,
        flags: &LockFlagsReader,
    ) -> LayerStatus {
        if let Some(handle) = self.handle.as_mut() {
            let placement = handle.descriptor().placement;
            return match handle.enable() {
                Ok(()) => LayerStatus::Active(placement),
                // Stays installed; the next activation tries again.
                Err(HookError::Install(err)) => {
                    log::warn!("{err}");
                    LayerStatus::Failed(err)
                }
                Err(err) => {
                    log::error!("Pointer hook unusable: {err}");
                    self.handle = None;
                    self.bring_up(registry, flags)
                }
            };
        }

        let mut last_failure = None;
        for descriptor in self.candidates {
            let mut handle = HookHandle::new(*descriptor, Rc::clone(registry));
            let mask = descriptor.mask;
            let reader = flags.clone();
            let callback: HookCallback =
                Arc::new(move |event| pointer_verdict(&reader, mask, event));
            match handle.install(callback).and_then(|()| handle.enable()) {
                Ok(()) => {
                    self.handle = Some(handle);
                    return LayerStatus::Active(descriptor.placement);
                }
                Err(HookError::Install(err)) => {
                    log::warn!("{err}; trying next placement");
                    last_failure = Some(err);
                }
                Err(err) => log::error!("Pointer hook unusable: {err}"),
            }
        }
        match last_failure {
            Some(err) => LayerStatus::Failed(err),
            None => LayerStatus::Failed(InstallError::new(
                self.layer(),
                self.candidates[0].placement,
                InstallFailure::Unsupported,
            )),
        }
    }
}

pub struct PointerInterceptor {
    registry: Rc<dyn HookRegistry>,
    flags: LockFlagsReader,
    layers: Vec<PointerLayer>,
}

impl PointerInterceptor {
    pub fn new(registry: Rc<dyn HookRegistry>, flags: LockFlagsReader) -> Self {
        Self {
            registry,
            flags,
            layers: Vec::new(),
        }
    }

    /// Brings up every layer. Always succeeds; check the returned coverage.
    pub fn activate(&mut self) -> PointerActivation {
        if self.layers.is_empty() {
            self.layers = LAYERS
                .iter()
                .map(|candidates| PointerLayer {
                    candidates,
                    handle: None,
                })
                .collect();
        }

        let outcomes: Vec<LayerOutcome> = self
            .layers
            .iter_mut()
            .map(|layer| LayerOutcome {
                layer: layer.layer(),
                status: layer.bring_up(&self.registry, &self.flags),
            })
            .collect();
        let coverage = Coverage::from_outcomes(&outcomes);
        match coverage {
            Coverage::Complete => log::info!("Pointer lock active on all layers"),
            Coverage::Partial => log::warn!(
                "Pointer lock degraded: {} of {} layers active",
                outcomes.iter().filter(|o| o.is_active()).count(),
                outcomes.len()
            ),
            Coverage::Unprotected => {
                log::error!("Pointer lock degraded: no blocking layer could be installed")
            }
        }
        PointerActivation {
            layers: outcomes,
            coverage,
        }
    }

    pub fn deactivate(&mut self) {
        for handle in self.layers.iter_mut().filter_map(|l| l.handle.as_mut()) {
            handle.disable();
        }
    }

    pub fn release(&mut self) {
        for handle in self.layers.iter_mut().filter_map(|l| l.handle.as_mut()) {
            handle.invalidate();
        }
        self.layers.clear();
    }

    pub fn handle_count(&self) -> usize {
        self.layers.iter().filter(|l| l.handle.is_some()).count()
    }

    pub fn lifecycles(&self) -> Vec<(LayerId, HookLifecycle)> {
        self.layers
            .iter()
            .filter_map(|l| l.handle.as_ref())
            .map(|h| (h.layer(), h.lifecycle()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, Point};
    use crate::sim::SimRegistry;
    use crate::state::{Device, LockFlags};

    fn setup() -> (Rc<SimRegistry>, LockFlags, PointerInterceptor) {
        let registry = Rc::new(SimRegistry::new());
        let flags = LockFlags::new();
        let interceptor = PointerInterceptor::new(registry.clone(), flags.reader());
        (registry, flags, interceptor)
    }

    #[test]
    fn all_layers_come_up() {
        let (registry, flags, mut interceptor) = setup();
        let activation = interceptor.activate();
        assert_eq!(activation.coverage, Coverage::Complete);
        assert_eq!(activation.layers.len(), 4);
        assert_eq!(registry.enabled_count(), 4);
        flags.raise(Device::Pointer);

        let moved = InputEvent::pointer(EventKind::MouseMoved, Point::new(1.0, 2.0));
        assert_eq!(
            registry.deliver(&moved).blocked_by,
            Some(LayerId::PointerDeviceCapture)
        );
        let pinch = InputEvent::new(EventKind::Magnify);
        assert_eq!(
            registry.deliver(&pinch).blocked_by,
            Some(LayerId::PointerGestureMonitor)
        );
    }

    #[test]
    fn event_tap_falls_back_to_session_placement() {
        let (registry, _flags, mut interceptor) = setup();
        registry.fail_placement(Placement::HidTap, InstallFailure::PermissionDenied);
        let activation = interceptor.activate();
        assert_eq!(activation.coverage, Coverage::Complete);
        assert!(activation.layers.contains(&LayerOutcome {
            layer: LayerId::PointerEventTap,
            status: LayerStatus::Active(Placement::SessionTap),
        }));
        assert!(registry
            .live_layers()
            .contains(&(LayerId::PointerEventTap, Placement::SessionTap)));
    }

    #[test]
    fn a_failed_device_capture_does_not_stop_the_rest() {
        let (registry, flags, mut interceptor) = setup();
        registry.fail_layer(LayerId::PointerDeviceCapture, InstallFailure::DeviceBusy);
        let activation = interceptor.activate();
        assert_eq!(activation.coverage, Coverage::Partial);
        assert_eq!(registry.enabled_count(), 3);
        flags.raise(Device::Pointer);

        let click = InputEvent::pointer(EventKind::LeftMouseDown, Point::new(5.0, 5.0));
        assert_eq!(
            registry.deliver(&click).blocked_by,
            Some(LayerId::PointerEventTap)
        );
    }

    #[test]
    fn scroll_tap_blocks_when_event_tap_is_missing() {
        let (registry, flags, mut interceptor) = setup();
        registry.fail_layer(LayerId::PointerDeviceCapture, InstallFailure::DeviceBusy);
        registry.fail_layer(LayerId::PointerEventTap, InstallFailure::PermissionDenied);
        interceptor.activate();
        flags.raise(Device::Pointer);

        let scroll = InputEvent::new(EventKind::ScrollWheel);
        assert_eq!(
            registry.deliver(&scroll).blocked_by,
            Some(LayerId::PointerScrollTap)
        );
        // Plain movement now has no layer to stop it.
        let moved = InputEvent::pointer(EventKind::MouseMoved, Point::new(1.0, 1.0));
        assert!(!registry.deliver(&moved).is_blocked());
    }

    #[test]
    fn all_layers_failing_still_activates() {
        let (registry, _flags, mut interceptor) = setup();
        registry.fail_all(InstallFailure::PermissionDenied);
        let activation = interceptor.activate();
        assert_eq!(activation.coverage, Coverage::Unprotected);
        assert!(activation.layers.iter().all(|o| !o.is_active()));
        assert_eq!(interceptor.handle_count(), 0);
    }

    #[test]
    fn unlocked_events_pass_unchanged() {
        let (registry, _flags, mut interceptor) = setup();
        interceptor.activate();
        let moved = InputEvent::pointer(EventKind::MouseMoved, Point::new(1.0, 1.0));
        let delivery = registry.deliver(&moved);
        assert!(!delivery.is_blocked());
        assert_eq!(
            delivery.reached,
            vec![LayerId::PointerDeviceCapture, LayerId::PointerEventTap]
        );
    }

    #[test]
    fn reactivation_reuses_installed_layers() {
        let (registry, _flags, mut interceptor) = setup();
        interceptor.activate();
        interceptor.deactivate();
        assert_eq!(registry.enabled_count(), 0);
        interceptor.activate();
        assert_eq!(registry.registered_count(), 4);
        assert_eq!(interceptor.handle_count(), 4);
        assert!(interceptor
            .lifecycles()
            .iter()
            .all(|(_, lifecycle)| lifecycle.is_enabled()));
    }

    #[test]
    fn device_grabbed_between_locks_drops_coverage() {
        let (registry, _flags, mut interceptor) = setup();
        assert_eq!(interceptor.activate().coverage, Coverage::Complete);
        interceptor.deactivate();

        registry.fail_enable(LayerId::PointerDeviceCapture, InstallFailure::DeviceBusy);
        let activation = interceptor.activate();
        assert_eq!(activation.coverage, Coverage::Partial);
        assert!(matches!(
            activation.layers[0],
            LayerOutcome {
                layer: LayerId::PointerDeviceCapture,
                status: LayerStatus::Failed(InstallError {
                    reason: InstallFailure::DeviceBusy,
                    ..
                }),
            }
        ));
        assert_eq!(registry.enabled_count(), 3);
        assert_eq!(interceptor.handle_count(), 4);

        // Released by the other client: the kept handle comes back.
        registry.clear_failures();
        interceptor.deactivate();
        assert_eq!(interceptor.activate().coverage, Coverage::Complete);
        assert_eq!(registry.registered_count(), 4);
    }
}
