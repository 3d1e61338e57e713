//! X event translation
//!
//! Narrows x11rb's [`Event`] to what the screen mirror consumes, together
//! with the window used to route it to a screen.

use x11rb::protocol::Event;

use crate::shared::Geometry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorEvent {
    Create { window: u32, parent: u32 },
    Destroy { window: u32 },
    Map { window: u32 },
    Unmap { window: u32 },
    Configure { window: u32, geometry: Geometry, above: Option<u32> },
    Reparent { window: u32, parent: u32 },
    Damage { window: u32 },
    Property { window: u32, atom: u32, deleted: bool },
    Shape { window: u32 },
    Expose { window: u32, count: u16 },
}

/// A mirror event plus the window it was reported relative to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedEvent {
    pub event_window: u32,
    pub event: MirrorEvent,
}

impl RoutedEvent {
    fn new(event_window: u32, event: MirrorEvent) -> Option<Self> {
        Some(Self { event_window, event })
    }
}

fn non_none(id: u32) -> Option<u32> {
    (id != x11rb::NONE).then_some(id)
}

/// Translate an X event; `None` for events the mirror does not track.
pub fn translate(event: &Event) -> Option<RoutedEvent> {
    match event {
        Event::CreateNotify(e) => RoutedEvent::new(
            e.parent,
            MirrorEvent::Create { window: e.window, parent: e.parent },
        ),
        Event::DestroyNotify(e) => RoutedEvent::new(e.event, MirrorEvent::Destroy { window: e.window }),
        Event::MapNotify(e) => RoutedEvent::new(e.event, MirrorEvent::Map { window: e.window }),
        Event::UnmapNotify(e) => RoutedEvent::new(e.event, MirrorEvent::Unmap { window: e.window }),
        Event::ConfigureNotify(e) => RoutedEvent::new(
            e.event,
            MirrorEvent::Configure {
                window: e.window,
                geometry: Geometry::new(
                    e.x as i32,
                    e.y as i32,
                    e.width as u32,
                    e.height as u32,
                    e.border_width as u32,
                ),
                above: non_none(e.above_sibling),
            },
        ),
        Event::ReparentNotify(e) => RoutedEvent::new(
            e.event,
            MirrorEvent::Reparent { window: e.window, parent: e.parent },
        ),
        Event::DamageNotify(e) => RoutedEvent::new(e.drawable, MirrorEvent::Damage { window: e.drawable }),
        Event::PropertyNotify(e) => RoutedEvent::new(
            e.window,
            MirrorEvent::Property {
                window: e.window,
                atom: e.atom,
                deleted: e.state == x11rb::protocol::xproto::Property::DELETE,
            },
        ),
        Event::ShapeNotify(e) => RoutedEvent::new(
            e.affected_window,
            MirrorEvent::Shape { window: e.affected_window },
        ),
        Event::Expose(e) => RoutedEvent::new(e.window, MirrorEvent::Expose { window: e.window, count: e.count }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x11rb::protocol::xproto::{ConfigureNotifyEvent, CreateNotifyEvent, PropertyNotifyEvent, Property};

    #[test]
    fn test_configure_translation() {
        let event = Event::ConfigureNotify(ConfigureNotifyEvent {
            event: 1,
            window: 42,
            above_sibling: 0,
            x: -5,
            y: 10,
            width: 300,
            height: 200,
            border_width: 1,
            ..Default::default()
        });
        let routed = translate(&event).unwrap();
        assert_eq!(routed.event_window, 1);
        assert_eq!(
            routed.event,
            MirrorEvent::Configure {
                window: 42,
                geometry: Geometry::new(-5, 10, 300, 200, 1),
                above: None,
            }
        );
    }

    #[test]
    fn test_create_routes_by_parent() {
        let event = Event::CreateNotify(CreateNotifyEvent {
            parent: 1,
            window: 7,
            ..Default::default()
        });
        let routed = translate(&event).unwrap();
        assert_eq!(routed.event_window, 1);
        assert_eq!(routed.event, MirrorEvent::Create { window: 7, parent: 1 });
    }

    #[test]
    fn test_property_delete_flag() {
        let event = Event::PropertyNotify(PropertyNotifyEvent {
            window: 3,
            atom: 99,
            state: Property::DELETE,
            ..Default::default()
        });
        assert_eq!(
            translate(&event).unwrap().event,
            MirrorEvent::Property { window: 3, atom: 99, deleted: true }
        );
    }
}
