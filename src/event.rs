//! Raw input events as the hook layers see them.
//!
//! Event kinds are numbered the way CoreGraphics numbers `CGEventType`, so a
//! mask bit is simply `1 << kind`. Platform backends translate native events
//! into [`InputEvent`] before handing them to a hook callback.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Screen or window coordinate, top-left origin, in points.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn offset(self, dx: f64, dy: f64) -> Self {
        Self::new(self.x + dx, self.y + dy)
    }

    pub fn distance_to(self, other: Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub origin: Point,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            origin: Point::new(x, y),
            width,
            height,
        }
    }

    pub fn center(&self) -> Point {
        self.origin.offset(self.width / 2.0, self.height / 2.0)
    }
}

/// Input event types, discriminants match `CGEventType` / `NSEventType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum EventKind {
    LeftMouseDown = 1,
    LeftMouseUp = 2,
    RightMouseDown = 3,
    RightMouseUp = 4,
    MouseMoved = 5,
    LeftMouseDragged = 6,
    RightMouseDragged = 7,
    KeyDown = 10,
    KeyUp = 11,
    FlagsChanged = 12,
    SystemDefined = 14,
    Rotate = 18,
    BeginGesture = 19,
    EndGesture = 20,
    ScrollWheel = 22,
    TabletPointer = 23,
    TabletProximity = 24,
    OtherMouseDown = 25,
    OtherMouseUp = 26,
    OtherMouseDragged = 27,
    Gesture = 29,
    Magnify = 30,
    Swipe = 31,
    SmartMagnify = 32,
    Pressure = 34,
}

impl EventKind {
    pub const ALL: [EventKind; 25] = [
        EventKind::LeftMouseDown,
        EventKind::LeftMouseUp,
        EventKind::RightMouseDown,
        EventKind::RightMouseUp,
        EventKind::MouseMoved,
        EventKind::LeftMouseDragged,
        EventKind::RightMouseDragged,
        EventKind::KeyDown,
        EventKind::KeyUp,
        EventKind::FlagsChanged,
        EventKind::SystemDefined,
        EventKind::Rotate,
        EventKind::BeginGesture,
        EventKind::EndGesture,
        EventKind::ScrollWheel,
        EventKind::TabletPointer,
        EventKind::TabletProximity,
        EventKind::OtherMouseDown,
        EventKind::OtherMouseUp,
        EventKind::OtherMouseDragged,
        EventKind::Gesture,
        EventKind::Magnify,
        EventKind::Swipe,
        EventKind::SmartMagnify,
        EventKind::Pressure,
    ];

    pub const fn raw(self) -> u32 {
        self as u32
    }

    /// Maps a native event type number back to a kind; unknown types yield `None`.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.raw() == raw)
    }

    pub const fn is_key(self) -> bool {
        matches!(
            self,
            EventKind::KeyDown | EventKind::KeyUp | EventKind::FlagsChanged
        )
    }
}

/// Bit set of [`EventKind`]s a hook subscribes to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u64);

impl EventMask {
    /// Key presses, modifier changes and system-defined (media) keys.
    pub const KEYBOARD: EventMask = EventMask::of(&[
        EventKind::KeyDown,
        EventKind::KeyUp,
        EventKind::FlagsChanged,
        EventKind::SystemDefined,
    ]);

    /// Movement, click, scroll and tablet events.
    pub const POINTER: EventMask = EventMask::of(&[
        EventKind::LeftMouseDown,
        EventKind::LeftMouseUp,
        EventKind::RightMouseDown,
        EventKind::RightMouseUp,
        EventKind::MouseMoved,
        EventKind::LeftMouseDragged,
        EventKind::RightMouseDragged,
        EventKind::OtherMouseDown,
        EventKind::OtherMouseUp,
        EventKind::OtherMouseDragged,
        EventKind::ScrollWheel,
        EventKind::TabletPointer,
        EventKind::TabletProximity,
    ]);

    /// Multi-touch gestures: magnify, rotate, swipe, pressure, begin/end.
    pub const GESTURE: EventMask = EventMask::of(&[
        EventKind::Gesture,
        EventKind::Magnify,
        EventKind::Swipe,
        EventKind::Rotate,
        EventKind::BeginGesture,
        EventKind::EndGesture,
        EventKind::SmartMagnify,
        EventKind::Pressure,
    ]);

    pub const SCROLL: EventMask = EventMask::of(&[EventKind::ScrollWheel]);

    pub const KEY_DOWN: EventMask = EventMask::of(&[EventKind::KeyDown]);

    pub const fn of(kinds: &[EventKind]) -> Self {
        let mut bits = 0u64;
        let mut i = 0;
        while i < kinds.len() {
            bits |= 1u64 << (kinds[i] as u32);
            i += 1;
        }
        EventMask(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, kind: EventKind) -> bool {
        self.0 & (1u64 << (kind as u32)) != 0
    }

    pub const fn union(self, other: EventMask) -> Self {
        EventMask(self.0 | other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        self.union(rhs)
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<EventKind> = EventKind::ALL
            .iter()
            .copied()
            .filter(|kind| self.contains(*kind))
            .collect();
        f.debug_tuple("EventMask").field(&kinds).finish()
    }
}

/// Modifier key state, using the `CGEventFlags` bit layout.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Modifiers(u64);

impl Modifiers {
    pub const NONE: Modifiers = Modifiers(0);
    pub const SHIFT: Modifiers = Modifiers(1 << 17);
    pub const CONTROL: Modifiers = Modifiers(1 << 18);
    pub const OPTION: Modifiers = Modifiers(1 << 19);
    pub const COMMAND: Modifiers = Modifiers(1 << 20);
    pub const FUNCTION: Modifiers = Modifiers(1 << 23);

    const NAMED: [(&'static str, Modifiers); 5] = [
        ("shift", Modifiers::SHIFT),
        ("control", Modifiers::CONTROL),
        ("option", Modifiers::OPTION),
        ("command", Modifiers::COMMAND),
        ("function", Modifiers::FUNCTION),
    ];

    /// Keeps only the device-independent modifier bits of a raw flag word.
    pub const fn from_flags(flags: u64) -> Self {
        Modifiers(
            flags
                & (Self::SHIFT.0
                    | Self::CONTROL.0
                    | Self::OPTION.0
                    | Self::COMMAND.0
                    | Self::FUNCTION.0),
        )
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, other: Modifiers) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Modifiers {
    type Output = Modifiers;

    fn bitor(self, rhs: Modifiers) -> Modifiers {
        Modifiers(self.0 | rhs.0)
    }
}

impl BitOrAssign for Modifiers {
    fn bitor_assign(&mut self, rhs: Modifiers) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Modifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = (*self).into();
        f.debug_tuple("Modifiers").field(&names).finish()
    }
}

impl TryFrom<Vec<String>> for Modifiers {
    type Error = String;

    fn try_from(names: Vec<String>) -> Result<Self, Self::Error> {
        let mut modifiers = Modifiers::NONE;
        for name in &names {
            let lowered = name.to_ascii_lowercase();
            let (_, flag) = Self::NAMED
                .iter()
                .find(|(known, _)| *known == lowered)
                .ok_or_else(|| format!("unknown modifier '{name}'"))?;
            modifiers |= *flag;
        }
        Ok(modifiers)
    }
}

impl From<Modifiers> for Vec<String> {
    fn from(modifiers: Modifiers) -> Self {
        Modifiers::NAMED
            .iter()
            .filter(|(_, flag)| modifiers.contains(*flag))
            .map(|(name, _)| (*name).to_string())
            .collect()
    }
}

/// A key plus the modifiers that must be held with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyChord {
    pub keycode: u16,
    #[serde(default)]
    pub modifiers: Modifiers,
}

impl KeyChord {
    /// Escape virtual keycode.
    pub const ESCAPE: u16 = 53;
    /// Return virtual keycode.
    pub const RETURN: u16 = 36;

    /// Command-Option-Escape, the system "Force Quit Applications" shortcut.
    pub const FORCE_QUIT: KeyChord = KeyChord {
        keycode: Self::ESCAPE,
        modifiers: Modifiers(Modifiers::COMMAND.0 | Modifiers::OPTION.0),
    };

    /// True for key-down/up events of this key with at least these modifiers held.
    pub fn matches(&self, event: &InputEvent) -> bool {
        matches!(event.kind, EventKind::KeyDown | EventKind::KeyUp)
            && event.keycode == Some(self.keycode)
            && event.modifiers.contains(self.modifiers)
    }
}

/// One event as delivered to a hook callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputEvent {
    pub kind: EventKind,
    pub keycode: Option<u16>,
    pub modifiers: Modifiers,
    pub location: Option<Point>,
    /// Identity of the physical press; observation points that see the same
    /// press report the same id.
    pub press_id: u64,
}

impl InputEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            keycode: None,
            modifiers: Modifiers::NONE,
            location: None,
            press_id: 0,
        }
    }

    pub fn key(kind: EventKind, keycode: u16, modifiers: Modifiers) -> Self {
        Self {
            keycode: Some(keycode),
            modifiers,
            ..Self::new(kind)
        }
    }

    pub fn pointer(kind: EventKind, location: Point) -> Self {
        Self {
            location: Some(location),
            ..Self::new(kind)
        }
    }

    pub fn with_press_id(mut self, press_id: u64) -> Self {
        self.press_id = press_id;
        self
    }
}

/// What a hook callback tells the OS to do with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// Return "no event" instead of forwarding.
    Swallow,
}
