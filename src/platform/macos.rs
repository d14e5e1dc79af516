//! macOS backend.
//!
//! Event taps and the HID manager live on a dedicated `input-hooks` thread
//! that runs its own CFRunLoop, so tap callbacks never wait on the
//! cooperative loop. Requires the Accessibility permission (System Settings →
//! Privacy & Security → Accessibility); without it every tap fails to
//! install and locks degrade to unprotected.

use crate::enforcer::{PointerControl, WindowHost};
use crate::engine::Backend;
use crate::error::{InstallError, InstallFailure};
use crate::event::{EventKind, InputEvent, Modifiers, Point, Rect, Verdict};
use crate::hook::{
    HookCallback, HookDescriptor, HookRegistry, HookToken, LayerId, Placement, TapMode,
};
use crate::permission::PermissionProbe;
use crate::schedule::TokioScheduler;
use objc2::MainThreadMarker;
use objc2_app_kit::{NSApplication, NSApplicationActivationPolicy, NSScreen};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::io;
use std::ptr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

// CoreGraphics / CoreFoundation / IOKit types.
type CFAllocatorRef = *const c_void;
type CFTypeRef = *const c_void;
type CFStringRef = *const c_void;
type CFDictionaryRef = *const c_void;
type CFMachPortRef = *mut c_void;
type CFRunLoopRef = *mut c_void;
type CFRunLoopSourceRef = *mut c_void;
type CGEventRef = *mut c_void;
type CGEventTapProxy = *mut c_void;
type IOHIDManagerRef = *mut c_void;

#[repr(C)]
#[derive(Clone, Copy)]
struct CGPoint {
    x: f64,
    y: f64,
}

#[repr(C)]
struct CFDictionaryCallBacks {
    _opaque: [u8; 0],
}

type CGEventTapCallBack = unsafe extern "C" fn(
    proxy: CGEventTapProxy,
    event_type: u32,
    event: CGEventRef,
    user_info: *mut c_void,
) -> CGEventRef;

// Tap locations.
const CG_HID_EVENT_TAP: u32 = 0;
const CG_SESSION_EVENT_TAP: u32 = 1;
const CG_ANNOTATED_SESSION_EVENT_TAP: u32 = 2;
const CG_HEAD_INSERT_EVENT_TAP: u32 = 0;
const CG_TAIL_APPEND_EVENT_TAP: u32 = 1;
const CG_EVENT_TAP_OPTION_DEFAULT: u32 = 0;
const CG_EVENT_TAP_OPTION_LISTEN_ONLY: u32 = 1;

/// Pseudo-events a tap receives after the OS has switched it off.
const CG_EVENT_TAP_DISABLED_BY_TIMEOUT: u32 = 0xFFFF_FFFE;
const CG_EVENT_TAP_DISABLED_BY_USER_INPUT: u32 = 0xFFFF_FFFF;

/// kCGKeyboardEventKeycode.
const CG_KEYBOARD_EVENT_KEYCODE: u32 = 9;

const K_IO_HID_OPTIONS_TYPE_NONE: u32 = 0;
const K_IO_HID_OPTIONS_TYPE_SEIZE_DEVICE: u32 = 1;
const K_IO_RETURN_EXCLUSIVE_ACCESS: i32 = 0xE000_02C5_u32 as i32;
const K_IO_RETURN_NOT_PERMITTED: i32 = 0xE000_02E2_u32 as i32;
const K_HID_PAGE_GENERIC_DESKTOP: i32 = 0x01;
const K_HID_USAGE_GD_MOUSE: i32 = 0x02;

const K_CF_NUMBER_SINT32_TYPE: isize = 3;
const K_CF_STRING_ENCODING_UTF8: u32 = 0x0800_0100;
const K_CF_RUN_LOOP_RUN_FINISHED: i32 = 1;

#[link(name = "ApplicationServices", kind = "framework")]
extern "C" {
    fn AXIsProcessTrusted() -> bool;
    fn AXIsProcessTrustedWithOptions(options: CFDictionaryRef) -> bool;
    static kAXTrustedCheckOptionPrompt: CFStringRef;

    fn CGEventTapCreate(
        tap: u32,
        place: u32,
        options: u32,
        events_of_interest: u64,
        callback: CGEventTapCallBack,
        user_info: *mut c_void,
    ) -> CFMachPortRef;
    fn CGEventTapEnable(tap: CFMachPortRef, enable: bool);
    fn CGEventCreate(source: *const c_void) -> CGEventRef;
    fn CGEventGetIntegerValueField(event: CGEventRef, field: u32) -> i64;
    fn CGEventGetFlags(event: CGEventRef) -> u64;
    fn CGEventGetLocation(event: CGEventRef) -> CGPoint;
    fn CGEventGetTimestamp(event: CGEventRef) -> u64;
    fn CGWarpMouseCursorPosition(point: CGPoint) -> i32;
    fn CGAssociateMouseAndMouseCursorPosition(connected: bool) -> i32;
}

#[link(name = "CoreFoundation", kind = "framework")]
extern "C" {
    fn CFMachPortCreateRunLoopSource(
        allocator: CFAllocatorRef,
        port: CFMachPortRef,
        order: isize,
    ) -> CFRunLoopSourceRef;
    fn CFMachPortInvalidate(port: CFMachPortRef);
    fn CFRunLoopGetCurrent() -> CFRunLoopRef;
    fn CFRunLoopAddSource(rl: CFRunLoopRef, source: CFRunLoopSourceRef, mode: CFStringRef);
    fn CFRunLoopRemoveSource(rl: CFRunLoopRef, source: CFRunLoopSourceRef, mode: CFStringRef);
    fn CFRunLoopRunInMode(mode: CFStringRef, seconds: f64, return_after_source: bool) -> i32;
    fn CFRunLoopStop(rl: CFRunLoopRef);
    fn CFRunLoopWakeUp(rl: CFRunLoopRef);
    fn CFRelease(cf: CFTypeRef);
    fn CFNumberCreate(allocator: CFAllocatorRef, kind: isize, value: *const c_void) -> CFTypeRef;
    fn CFStringCreateWithCString(
        allocator: CFAllocatorRef,
        c_str: *const std::ffi::c_char,
        encoding: u32,
    ) -> CFStringRef;
    fn CFDictionaryCreate(
        allocator: CFAllocatorRef,
        keys: *const CFTypeRef,
        values: *const CFTypeRef,
        count: isize,
        key_callbacks: *const CFDictionaryCallBacks,
        value_callbacks: *const CFDictionaryCallBacks,
    ) -> CFDictionaryRef;

    static kCFRunLoopDefaultMode: CFStringRef;
    static kCFBooleanTrue: CFTypeRef;
    static kCFTypeDictionaryKeyCallBacks: CFDictionaryCallBacks;
    static kCFTypeDictionaryValueCallBacks: CFDictionaryCallBacks;
}

#[link(name = "IOKit", kind = "framework")]
extern "C" {
    fn IOHIDManagerCreate(allocator: CFAllocatorRef, options: u32) -> IOHIDManagerRef;
    fn IOHIDManagerSetDeviceMatching(manager: IOHIDManagerRef, matching: CFDictionaryRef);
    fn IOHIDManagerOpen(manager: IOHIDManagerRef, options: u32) -> i32;
    fn IOHIDManagerClose(manager: IOHIDManagerRef, options: u32) -> i32;
}

/// Run loop reference handed back from the hook thread. CFRunLoopStop and
/// CFRunLoopWakeUp may be called from any thread.
struct SendableRunLoop(CFRunLoopRef);
unsafe impl Send for SendableRunLoop {}

struct HookThread {
    run_loop: CFRunLoopRef,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl HookThread {
    fn spawn() -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<SendableRunLoop>();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let join = thread::Builder::new()
            .name("input-hooks".into())
            .spawn(move || unsafe {
                let _ = tx.send(SendableRunLoop(CFRunLoopGetCurrent()));
                while !flag.load(Ordering::SeqCst) {
                    // Returns immediately while no tap source is attached.
                    let result = CFRunLoopRunInMode(kCFRunLoopDefaultMode, 0.25, false);
                    if result == K_CF_RUN_LOOP_RUN_FINISHED {
                        thread::sleep(Duration::from_millis(20));
                    }
                }
                log::debug!("Input hook run loop exited");
            })?;
        let run_loop = rx.recv().map_err(|_| {
            io::Error::other("input hook thread exited before its run loop was ready")
        })?;
        Ok(Self {
            run_loop: run_loop.0,
            stop,
            join: Some(join),
        })
    }

    fn shutdown(&mut self) {
        let Some(join) = self.join.take() else { return };
        self.stop.store(true, Ordering::SeqCst);
        unsafe { CFRunLoopStop(self.run_loop) };
        let _ = join.join();
    }
}

/// Heap state behind a tap's `user_info` pointer. Freed only after the hook
/// thread has been joined, since a callback may still be running when the
/// tap is invalidated.
struct TapContext {
    callback: HookCallback,
    listen_only: bool,
    port: AtomicPtr<c_void>,
    wants_enabled: AtomicBool,
}

enum NativeHook {
    Tap {
        port: CFMachPortRef,
        source: CFRunLoopSourceRef,
        context: *mut TapContext,
    },
    Device {
        layer: LayerId,
        manager: IOHIDManagerRef,
        open: bool,
    },
}

#[derive(Default)]
struct RegistryState {
    next_token: u64,
    hooks: BTreeMap<HookToken, NativeHook>,
    retired: Vec<*mut TapContext>,
}

/// CGEventTap and IOHIDManager hook registry.
pub struct MacRegistry {
    thread: RefCell<HookThread>,
    state: RefCell<RegistryState>,
}

impl MacRegistry {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            thread: RefCell::new(HookThread::spawn()?),
            state: RefCell::new(RegistryState::default()),
        })
    }

    fn install_tap(
        &self,
        descriptor: &HookDescriptor,
        callback: HookCallback,
    ) -> Result<NativeHook, InstallFailure> {
        let (location, place) = match descriptor.placement {
            Placement::HidTap => (CG_HID_EVENT_TAP, CG_HEAD_INSERT_EVENT_TAP),
            Placement::SessionTap => (CG_SESSION_EVENT_TAP, CG_HEAD_INSERT_EVENT_TAP),
            Placement::AnnotatedSessionTap => {
                (CG_ANNOTATED_SESSION_EVENT_TAP, CG_HEAD_INSERT_EVENT_TAP)
            }
            Placement::AppMonitor => (CG_SESSION_EVENT_TAP, CG_TAIL_APPEND_EVENT_TAP),
            Placement::DeviceSeize => return Err(InstallFailure::Unsupported),
        };
        let listen_only = descriptor.mode == TapMode::Listen;
        let options = if listen_only {
            CG_EVENT_TAP_OPTION_LISTEN_ONLY
        } else {
            CG_EVENT_TAP_OPTION_DEFAULT
        };

        let context = Box::into_raw(Box::new(TapContext {
            callback,
            listen_only,
            port: AtomicPtr::new(ptr::null_mut()),
            wants_enabled: AtomicBool::new(false),
        }));
        let run_loop = self.thread.borrow().run_loop;

        unsafe {
            let port = CGEventTapCreate(
                location,
                place,
                options,
                descriptor.mask.bits(),
                tap_callback,
                context.cast::<c_void>(),
            );
            if port.is_null() {
                drop(Box::from_raw(context));
                return Err(if AXIsProcessTrusted() {
                    InstallFailure::Unsupported
                } else {
                    InstallFailure::PermissionDenied
                });
            }
            // Taps are created enabled; hooks start disabled.
            CGEventTapEnable(port, false);
            (*context).port.store(port, Ordering::Release);

            let source = CFMachPortCreateRunLoopSource(ptr::null(), port, 0);
            if source.is_null() {
                CFMachPortInvalidate(port);
                CFRelease(port as CFTypeRef);
                drop(Box::from_raw(context));
                return Err(InstallFailure::Os(-1));
            }
            CFRunLoopAddSource(run_loop, source, kCFRunLoopDefaultMode);
            CFRunLoopWakeUp(run_loop);
            Ok(NativeHook::Tap {
                port,
                source,
                context,
            })
        }
    }

    /// A seized device delivers nothing to the session, so no callback is
    /// attached.
    fn install_seize(&self, layer: LayerId) -> Result<NativeHook, InstallFailure> {
        unsafe {
            let manager = IOHIDManagerCreate(ptr::null(), K_IO_HID_OPTIONS_TYPE_NONE);
            if manager.is_null() {
                return Err(InstallFailure::Os(-1));
            }
            let matching = pointer_matching();
            IOHIDManagerSetDeviceMatching(manager, matching);
            if !matching.is_null() {
                CFRelease(matching);
            }

            // Trial seizure so a busy device fails at install, not at enable.
            let status = IOHIDManagerOpen(manager, K_IO_HID_OPTIONS_TYPE_SEIZE_DEVICE);
            if status != 0 {
                CFRelease(manager as CFTypeRef);
                return Err(seize_failure(status));
            }
            IOHIDManagerClose(manager, K_IO_HID_OPTIONS_TYPE_NONE);
            Ok(NativeHook::Device {
                layer,
                manager,
                open: false,
            })
        }
    }

    fn release(&self, hook: NativeHook, retired: &mut Vec<*mut TapContext>) {
        let run_loop = self.thread.borrow().run_loop;
        unsafe {
            match hook {
                NativeHook::Tap {
                    port,
                    source,
                    context,
                } => {
                    (*context).wants_enabled.store(false, Ordering::Release);
                    (*context).port.store(ptr::null_mut(), Ordering::Release);
                    CGEventTapEnable(port, false);
                    CFRunLoopRemoveSource(run_loop, source, kCFRunLoopDefaultMode);
                    CFMachPortInvalidate(port);
                    CFRelease(source as CFTypeRef);
                    CFRelease(port as CFTypeRef);
                    retired.push(context);
                }
                NativeHook::Device { manager, open, .. } => {
                    if open {
                        IOHIDManagerClose(manager, K_IO_HID_OPTIONS_TYPE_NONE);
                    }
                    CFRelease(manager as CFTypeRef);
                }
            }
        }
    }
}

impl HookRegistry for MacRegistry {
    fn register_hook(
        &self,
        descriptor: &HookDescriptor,
        callback: HookCallback,
    ) -> Result<HookToken, InstallError> {
        let hook = match descriptor.placement {
            Placement::DeviceSeize => self.install_seize(descriptor.layer),
            _ => self.install_tap(descriptor, callback),
        }
        .map_err(|reason| InstallError::new(descriptor.layer, descriptor.placement, reason))?;

        let mut state = self.state.borrow_mut();
        state.next_token += 1;
        let token = HookToken::new(state.next_token);
        state.hooks.insert(token, hook);
        Ok(token)
    }

    fn set_enabled(&self, token: HookToken, enabled: bool) -> Result<(), InstallError> {
        let mut state = self.state.borrow_mut();
        let Some(hook) = state.hooks.get_mut(&token) else {
            return Ok(());
        };
        unsafe {
            match hook {
                NativeHook::Tap { port, context, .. } => {
                    (**context).wants_enabled.store(enabled, Ordering::Release);
                    CGEventTapEnable(*port, enabled);
                }
                NativeHook::Device {
                    layer,
                    manager,
                    open,
                } => {
                    if enabled && !*open {
                        // The device may have been grabbed since the trial seizure.
                        let status = IOHIDManagerOpen(*manager, K_IO_HID_OPTIONS_TYPE_SEIZE_DEVICE);
                        if status != 0 {
                            return Err(InstallError::new(
                                *layer,
                                Placement::DeviceSeize,
                                seize_failure(status),
                            ));
                        }
                        *open = true;
                    } else if !enabled && *open {
                        IOHIDManagerClose(*manager, K_IO_HID_OPTIONS_TYPE_NONE);
                        *open = false;
                    }
                }
            }
        }
        Ok(())
    }

    fn invalidate(&self, token: HookToken) {
        let mut state = self.state.borrow_mut();
        if let Some(hook) = state.hooks.remove(&token) {
            let RegistryState { retired, .. } = &mut *state;
            self.release(hook, retired);
        }
    }
}

impl Drop for MacRegistry {
    fn drop(&mut self) {
        let mut state = self.state.borrow_mut();
        let hooks = std::mem::take(&mut state.hooks);
        for (_, hook) in hooks {
            self.release(hook, &mut state.retired);
        }
        self.thread.borrow_mut().shutdown();
        for context in state.retired.drain(..) {
            drop(unsafe { Box::from_raw(context) });
        }
    }
}

fn seize_failure(status: i32) -> InstallFailure {
    match status {
        K_IO_RETURN_EXCLUSIVE_ACCESS => InstallFailure::DeviceBusy,
        K_IO_RETURN_NOT_PERMITTED => InstallFailure::PermissionDenied,
        code => InstallFailure::Os(code),
    }
}

/// Matching dictionary for generic-desktop mice (trackpads included).
unsafe fn pointer_matching() -> CFDictionaryRef {
    let page_key = CFStringCreateWithCString(
        ptr::null(),
        c"DeviceUsagePage".as_ptr(),
        K_CF_STRING_ENCODING_UTF8,
    );
    let usage_key =
        CFStringCreateWithCString(ptr::null(), c"DeviceUsage".as_ptr(), K_CF_STRING_ENCODING_UTF8);
    let page = CFNumberCreate(
        ptr::null(),
        K_CF_NUMBER_SINT32_TYPE,
        (&K_HID_PAGE_GENERIC_DESKTOP as *const i32).cast(),
    );
    let usage = CFNumberCreate(
        ptr::null(),
        K_CF_NUMBER_SINT32_TYPE,
        (&K_HID_USAGE_GD_MOUSE as *const i32).cast(),
    );

    let parts = [page_key, usage_key, page, usage];
    if parts.iter().any(|p| p.is_null()) {
        parts.iter().filter(|p| !p.is_null()).for_each(|p| CFRelease(*p));
        return ptr::null();
    }
    let keys = [page_key, usage_key];
    let values = [page, usage];
    let dict = CFDictionaryCreate(
        ptr::null(),
        keys.as_ptr(),
        values.as_ptr(),
        2,
        &kCFTypeDictionaryKeyCallBacks,
        &kCFTypeDictionaryValueCallBacks,
    );
    parts.iter().for_each(|p| CFRelease(*p));
    dict
}

/// Runs on the `input-hooks` thread for every tapped event. O(1).
unsafe extern "C" fn tap_callback(
    _proxy: CGEventTapProxy,
    event_type: u32,
    event: CGEventRef,
    user_info: *mut c_void,
) -> CGEventRef {
    let context = &*(user_info as *const TapContext);

    if matches!(
        event_type,
        CG_EVENT_TAP_DISABLED_BY_TIMEOUT | CG_EVENT_TAP_DISABLED_BY_USER_INPUT
    ) {
        let port = context.port.load(Ordering::Acquire);
        if context.wants_enabled.load(Ordering::Acquire) && !port.is_null() {
            CGEventTapEnable(port, true);
        }
        return event;
    }

    let Some(kind) = EventKind::from_raw(event_type) else {
        return event;
    };
    let input = translate(kind, event);
    match (context.callback)(&input) {
        Verdict::Swallow if !context.listen_only => ptr::null_mut(),
        _ => event,
    }
}

unsafe fn translate(kind: EventKind, event: CGEventRef) -> InputEvent {
    let location = CGEventGetLocation(event);
    let mut input = InputEvent::pointer(kind, Point::new(location.x, location.y));
    input.modifiers = Modifiers::from_flags(CGEventGetFlags(event));
    if kind.is_key() {
        input.keycode = Some(CGEventGetIntegerValueField(event, CG_KEYBOARD_EVENT_KEYCODE) as u16);
        // Every observer of one press sees the same hardware timestamp.
        input.press_id = CGEventGetTimestamp(event);
    }
    input
}

/// Cursor position and warping through CoreGraphics.
pub struct CorePointer;

impl PointerControl for CorePointer {
    fn position(&self) -> Option<Point> {
        unsafe {
            let event = CGEventCreate(ptr::null());
            if event.is_null() {
                return None;
            }
            let at = CGEventGetLocation(event);
            CFRelease(event as CFTypeRef);
            Some(Point::new(at.x, at.y))
        }
    }

    fn warp(&self, to: Point) -> bool {
        unsafe {
            let status = CGWarpMouseCursorPosition(CGPoint { x: to.x, y: to.y });
            // Cancels the post-warp suppression interval.
            CGAssociateMouseAndMouseCursorPosition(true);
            status == 0
        }
    }
}

pub struct AccessibilityProbe;

impl PermissionProbe for AccessibilityProbe {
    fn is_trusted(&self) -> bool {
        unsafe { AXIsProcessTrusted() }
    }

    fn request_permission(&self) {
        unsafe {
            let keys = [kAXTrustedCheckOptionPrompt];
            let values = [kCFBooleanTrue];
            let options = CFDictionaryCreate(
                ptr::null(),
                keys.as_ptr(),
                values.as_ptr(),
                1,
                &kCFTypeDictionaryKeyCallBacks,
                &kCFTypeDictionaryValueCallBacks,
            );
            AXIsProcessTrustedWithOptions(options);
            if !options.is_null() {
                CFRelease(options);
            }
        }
    }
}

/// Foreground host for a process without a window of its own: the anchor
/// is the centre of the main screen.
pub struct ForegroundHost {
    mtm: MainThreadMarker,
}

impl WindowHost for ForegroundHost {
    #[allow(unused_unsafe)]
    fn is_focused(&self) -> bool {
        unsafe { NSApplication::sharedApplication(self.mtm).isActive() }
    }

    #[allow(deprecated, unused_unsafe)]
    fn bring_to_front(&self) {
        unsafe { NSApplication::sharedApplication(self.mtm).activateIgnoringOtherApps(true) };
    }

    fn window_origin(&self) -> Point {
        Point::default()
    }

    fn anchor_rect(&self) -> Rect {
        match NSScreen::mainScreen(self.mtm) {
            Some(screen) => {
                let frame = screen.frame();
                Rect::new(0.0, 0.0, frame.size.width, frame.size.height)
            }
            None => Rect::default(),
        }
    }
}

/// Builds the native backend. Must be called on the main thread.
#[allow(unused_unsafe)]
pub fn native_backend() -> io::Result<Backend> {
    let mtm = MainThreadMarker::new()
        .ok_or_else(|| io::Error::other("the macOS backend must be created on the main thread"))?;
    unsafe {
        NSApplication::sharedApplication(mtm)
            .setActivationPolicy(NSApplicationActivationPolicy::Accessory);
    }
    Ok(Backend {
        registry: Rc::new(MacRegistry::new()?),
        window: Rc::new(ForegroundHost { mtm }),
        pointer: Rc::new(CorePointer),
        permission: Rc::new(AccessibilityProbe),
        scheduler: Rc::new(TokioScheduler),
    })
}
