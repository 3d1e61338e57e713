//! Atom registry
//!
//! Property names the core observes, interned once per process.

use std::sync::OnceLock;

use anyhow::{Context, Result};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{Atom, ConnectionExt};

// Interned atoms observed by the compositor
x11rb::atom_manager! {
    pub Atoms: AtomsCookie {
        _NET_ACTIVE_WINDOW,
        _NET_WM_WINDOW_OPACITY,
        _NET_WM_NAME,
        _XROOTPMAP_ID,
        _WIN_WORKSPACE,
        _WIN_WORKSPACE_COUNT,
        _FLUXBOX_RECONFIGURE_RECT,
        UTF8_STRING,
    }
}

static ATOMS: OnceLock<Atoms> = OnceLock::new();

/// The process-wide atom set, interned on first use.
pub fn get_or_intern<C: Connection>(conn: &C) -> Result<Atoms> {
    if let Some(atoms) = ATOMS.get() {
        return Ok(*atoms);
    }
    let atoms = Atoms::new(conn)
        .context("Failed to send atom intern requests")?
        .reply()
        .context("Failed to intern atoms")?;
    Ok(*ATOMS.get_or_init(|| atoms))
}

/// The compositing-manager selection name for screen `screen_num`
pub fn cm_selection_name(screen_num: usize) -> String {
    format!("_NET_WM_CM_S{}", screen_num)
}

/// Intern the compositing-manager selection atom for a screen
pub fn intern_cm_selection<C: Connection>(conn: &C, screen_num: usize) -> Result<Atom> {
    let name = cm_selection_name(screen_num);
    Ok(conn
        .intern_atom(false, name.as_bytes())?
        .reply()
        .with_context(|| format!("Failed to intern {}", name))?
        .atom)
}

#[cfg(test)]
pub(crate) fn test_atoms() -> Atoms {
    Atoms {
        _NET_ACTIVE_WINDOW: 301,
        _NET_WM_WINDOW_OPACITY: 302,
        _NET_WM_NAME: 303,
        _XROOTPMAP_ID: 304,
        _WIN_WORKSPACE: 305,
        _WIN_WORKSPACE_COUNT: 306,
        _FLUXBOX_RECONFIGURE_RECT: 307,
        UTF8_STRING: 308,
    }
}
