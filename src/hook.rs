//! Hook handles: owned, lifecycle-checked references to one installed OS
//! interception point.
//!
//! The engine never talks to the OS directly. A [`HookRegistry`] is the
//! capability that installs hooks and returns opaque [`HookToken`]s; a
//! [`HookHandle`] wraps one token and only allows the legal lifecycle path
//! `Uninstalled -> InstalledDisabled <-> InstalledEnabled -> Invalidated`.

use crate::error::{HookError, InstallError};
use crate::event::{EventMask, InputEvent, Verdict};
use serde::Serialize;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// Which blocking or observation layer a hook belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerId {
    KeyboardHardware,
    KeyboardSession,
    PointerDeviceCapture,
    PointerEventTap,
    PointerGestureMonitor,
    PointerScrollTap,
    EscapeObserver,
}

impl LayerId {
    pub const fn name(self) -> &'static str {
        match self {
            LayerId::KeyboardHardware => "keyboard-hardware",
            LayerId::KeyboardSession => "keyboard-session",
            LayerId::PointerDeviceCapture => "pointer-device-capture",
            LayerId::PointerEventTap => "pointer-event-tap",
            LayerId::PointerGestureMonitor => "pointer-gesture-monitor",
            LayerId::PointerScrollTap => "pointer-scroll-tap",
            LayerId::EscapeObserver => "escape-observer",
        }
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where in the OS delivery pipeline a hook sits. Declaration order is
/// delivery order: earlier placements see an event first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Exclusive seizure of the physical device at driver registration.
    DeviceSeize,
    /// Event tap at the HID system level (most privileged).
    HidTap,
    /// Event tap where HID events enter the login session.
    SessionTap,
    /// Event tap after events are annotated for delivery to an application.
    AnnotatedSessionTap,
    /// Tail-appended monitor, after every other tap.
    AppMonitor,
}

impl Placement {
    pub const fn name(self) -> &'static str {
        match self {
            Placement::DeviceSeize => "device-seize",
            Placement::HidTap => "hid-tap",
            Placement::SessionTap => "session-tap",
            Placement::AnnotatedSessionTap => "annotated-session-tap",
            Placement::AppMonitor => "app-monitor",
        }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether a hook may swallow events or only observe them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TapMode {
    Capture,
    Listen,
}

/// Static description of one hook. Never changes at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookDescriptor {
    pub layer: LayerId,
    pub mask: EventMask,
    pub placement: Placement,
    pub mode: TapMode,
}

impl HookDescriptor {
    pub const fn new(layer: LayerId, mask: EventMask, placement: Placement, mode: TapMode) -> Self {
        Self {
            layer,
            mask,
            placement,
            mode,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookLifecycle {
    Uninstalled,
    InstalledDisabled,
    InstalledEnabled,
    Invalidated,
}

impl HookLifecycle {
    pub const fn is_enabled(self) -> bool {
        matches!(self, HookLifecycle::InstalledEnabled)
    }
}

/// Callback run by the OS for every event matching the hook's mask.
///
/// Runs on an OS-managed thread; must be O(1) and must not block.
pub type HookCallback = Arc<dyn Fn(&InputEvent) -> Verdict + Send + Sync>;

/// Opaque identifier a registry hands out for an installed hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookToken(u64);

impl HookToken {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// OS hook capability consumed by the engine.
///
/// Called only from the cooperative loop. Installed hooks start disabled.
pub trait HookRegistry {
    fn register_hook(
        &self,
        descriptor: &HookDescriptor,
        callback: HookCallback,
    ) -> Result<HookToken, InstallError>;

    /// Enabling can fail where it acquires something, such as a device
    /// seizure. Disabling never fails.
    fn set_enabled(&self, token: HookToken, enabled: bool) -> Result<(), InstallError>;

    /// Removes the hook permanently. The token is dead afterwards.
    fn invalidate(&self, token: HookToken);
}

/// Owned handle to one OS hook.
///
/// Dropping the handle invalidates the hook.
pub struct HookHandle {
    descriptor: HookDescriptor,
    lifecycle: HookLifecycle,
    token: Option<HookToken>,
    registry: Rc<dyn HookRegistry>,
}

impl HookHandle {
    pub fn new(descriptor: HookDescriptor, registry: Rc<dyn HookRegistry>) -> Self {
        Self {
            descriptor,
            lifecycle: HookLifecycle::Uninstalled,
            token: None,
            registry,
        }
    }

    pub fn descriptor(&self) -> &HookDescriptor {
        &self.descriptor
    }

    pub fn layer(&self) -> LayerId {
        self.descriptor.layer
    }

    pub fn lifecycle(&self) -> HookLifecycle {
        self.lifecycle
    }

    /// Installs the hook (disabled). A no-op if it is already installed; a
    /// failed install leaves the handle `Uninstalled` so it can be retried.
    pub fn install(&mut self, callback: HookCallback) -> Result<(), HookError> {
        match self.lifecycle {
            HookLifecycle::Uninstalled => {
                let token = self.registry.register_hook(&self.descriptor, callback)?;
                self.token = Some(token);
                self.lifecycle = HookLifecycle::InstalledDisabled;
                log::info!(
                    "Installed {} hook at {}",
                    self.descriptor.layer,
                    self.descriptor.placement
                );
                Ok(())
            }
            HookLifecycle::InstalledDisabled | HookLifecycle::InstalledEnabled => Ok(()),
            HookLifecycle::Invalidated => Err(self.illegal(HookLifecycle::InstalledDisabled)),
        }
    }

    pub fn enable(&mut self) -> Result<(), HookError> {
        match (self.lifecycle, self.token) {
            (HookLifecycle::InstalledDisabled, Some(token)) => {
                self.registry.set_enabled(token, true)?;
                self.lifecycle = HookLifecycle::InstalledEnabled;
                log::debug!("Enabled {} hook", self.descriptor.layer);
                Ok(())
            }
            (HookLifecycle::InstalledEnabled, _) => Ok(()),
            _ => Err(self.illegal(HookLifecycle::InstalledEnabled)),
        }
    }

    /// Disables an enabled hook; anything else is left as is.
    pub fn disable(&mut self) {
        if let (HookLifecycle::InstalledEnabled, Some(token)) = (self.lifecycle, self.token) {
            if let Err(err) = self.registry.set_enabled(token, false) {
                log::warn!("Disabling {} hook: {err}", self.descriptor.layer);
            }
            self.lifecycle = HookLifecycle::InstalledDisabled;
            log::debug!("Disabled {} hook", self.descriptor.layer);
        }
    }

    /// Releases the hook for good. Idempotent.
    pub fn invalidate(&mut self) {
        if self.lifecycle == HookLifecycle::Invalidated {
            return;
        }
        self.disable();
        if let Some(token) = self.token.take() {
            self.registry.invalidate(token);
            log::info!("Invalidated {} hook", self.descriptor.layer);
        }
        self.lifecycle = HookLifecycle::Invalidated;
    }

    fn illegal(&self, to: HookLifecycle) -> HookError {
        HookError::IllegalTransition {
            layer: self.descriptor.layer,
            from: self.lifecycle,
            to,
        }
    }
}

impl Drop for HookHandle {
    fn drop(&mut self) {
        self.invalidate();
    }
}

impl fmt::Debug for HookHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookHandle")
            .field("descriptor", &self.descriptor)
            .field("lifecycle", &self.lifecycle)
            .field("token", &self.token)
            .finish()
    }
}

/// Result of bringing up one layer during activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerOutcome {
    pub layer: LayerId,
    pub status: LayerStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerStatus {
    Active(Placement),
    Failed(InstallError),
}

impl LayerOutcome {
    pub fn is_active(&self) -> bool {
        matches!(self.status, LayerStatus::Active(_))
    }
}

/// How much of a device's blocking stack is in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Coverage {
    /// Every layer installed and enabled.
    Complete,
    /// Some layers failed; blocking may leak.
    Partial,
    /// No layer installed; nothing is blocked.
    Unprotected,
}

impl Coverage {
    pub fn from_outcomes(outcomes: &[LayerOutcome]) -> Self {
        let active = outcomes.iter().filter(|o| o.is_active()).count();
        if active == outcomes.len() {
            Coverage::Complete
        } else if active == 0 {
            Coverage::Unprotected
        } else {
            Coverage::Partial
        }
    }

    pub const fn is_degraded(self) -> bool {
        !matches!(self, Coverage::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InstallFailure;
    use crate::sim::SimRegistry;

    const DESCRIPTOR: HookDescriptor = HookDescriptor::new(
        LayerId::PointerScrollTap,
        EventMask::SCROLL,
        Placement::AnnotatedSessionTap,
        TapMode::Capture,
    );

    fn pass() -> HookCallback {
        Arc::new(|_| Verdict::Pass)
    }

    #[test]
    fn lifecycle_follows_legal_path() {
        let registry = Rc::new(SimRegistry::new());
        let mut handle = HookHandle::new(DESCRIPTOR, registry.clone());
        assert_eq!(handle.lifecycle(), HookLifecycle::Uninstalled);

        handle.install(pass()).unwrap();
        assert_eq!(handle.lifecycle(), HookLifecycle::InstalledDisabled);
        assert_eq!(registry.enabled_count(), 0);

        handle.enable().unwrap();
        assert_eq!(handle.lifecycle(), HookLifecycle::InstalledEnabled);
        assert_eq!(registry.enabled_count(), 1);

        handle.disable();
        handle.disable();
        assert_eq!(handle.lifecycle(), HookLifecycle::InstalledDisabled);
        assert_eq!(registry.enabled_count(), 0);

        handle.invalidate();
        handle.invalidate();
        assert_eq!(handle.lifecycle(), HookLifecycle::Invalidated);
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn enable_before_install_is_refused() {
        let registry = Rc::new(SimRegistry::new());
        let mut handle = HookHandle::new(DESCRIPTOR, registry);
        let err = handle.enable().unwrap_err();
        assert_eq!(
            err,
            HookError::IllegalTransition {
                layer: LayerId::PointerScrollTap,
                from: HookLifecycle::Uninstalled,
                to: HookLifecycle::InstalledEnabled,
            }
        );
    }

    #[test]
    fn invalidated_handle_never_comes_back() {
        let registry = Rc::new(SimRegistry::new());
        let mut handle = HookHandle::new(DESCRIPTOR, registry.clone());
        handle.install(pass()).unwrap();
        handle.invalidate();
        assert!(handle.install(pass()).is_err());
        assert!(handle.enable().is_err());
        assert_eq!(registry.registered_count(), 1);
    }

    #[test]
    fn failed_install_stays_retryable() {
        let registry = Rc::new(SimRegistry::new());
        registry.fail_layer(LayerId::PointerScrollTap, InstallFailure::PermissionDenied);
        let mut handle = HookHandle::new(DESCRIPTOR, registry.clone());
        assert!(matches!(
            handle.install(pass()),
            Err(HookError::Install(_))
        ));
        assert_eq!(handle.lifecycle(), HookLifecycle::Uninstalled);

        registry.clear_failures();
        handle.install(pass()).unwrap();
        assert_eq!(handle.lifecycle(), HookLifecycle::InstalledDisabled);
    }

    #[test]
    fn drop_releases_the_hook() {
        let registry = Rc::new(SimRegistry::new());
        {
            let mut handle = HookHandle::new(DESCRIPTOR, registry.clone());
            handle.install(pass()).unwrap();
            handle.enable().unwrap();
            assert_eq!(registry.live_count(), 1);
        }
        assert_eq!(registry.live_count(), 0);
        assert_eq!(registry.enabled_count(), 0);
    }

    #[test]
    fn coverage_classification() {
        let active = LayerOutcome {
            layer: LayerId::PointerEventTap,
            status: LayerStatus::Active(Placement::HidTap),
        };
        let failed = LayerOutcome {
            layer: LayerId::PointerDeviceCapture,
            status: LayerStatus::Failed(InstallError::new(
                LayerId::PointerDeviceCapture,
                Placement::DeviceSeize,
                InstallFailure::DeviceBusy,
            )),
        };
        assert_eq!(Coverage::from_outcomes(&[active, active]), Coverage::Complete);
        assert_eq!(Coverage::from_outcomes(&[active, failed]), Coverage::Partial);
        assert_eq!(Coverage::from_outcomes(&[failed]), Coverage::Unprotected);
        assert!(Coverage::Partial.is_degraded());
        assert!(!Coverage::Complete.is_degraded());
    }

    #[test]
    fn failed_enable_stays_disabled_and_retryable() {
        let registry = Rc::new(SimRegistry::new());
        registry.fail_enable(LayerId::PointerScrollTap, InstallFailure::DeviceBusy);
        let mut handle = HookHandle::new(DESCRIPTOR, registry.clone());
        handle.install(pass()).unwrap();

        assert!(matches!(handle.enable(), Err(HookError::Install(_))));
        assert_eq!(handle.lifecycle(), HookLifecycle::InstalledDisabled);

        registry.clear_failures();
        handle.enable().unwrap();
        assert_eq!(handle.lifecycle(), HookLifecycle::InstalledEnabled);
    }
}
