//! HAProxy configuration rendering and change-gated writes.
//!
//! The rendered config is a pure function of the ordered backend address
//! list. `write_if_changed` is the only thing that decides whether the
//! running HAProxy needs a reload: no write, no reload.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::{KUBERNETES_API_PORT, TALOS_API_PORT};

/// File mode of the rendered config.
const CONFIG_MODE: u32 = 0o644;

/// Render the HAProxy config for the given control-plane addresses.
///
/// Addresses are emitted in the given order; no sorting or deduplication
/// is applied.
pub fn render(addresses: &[IpAddr]) -> String {
    let mut out = String::new();

    out.push_str(
        "global\n\
         \x20 log stdout format raw local0\n\
         \n\
         defaults\n\
         \x20 log global\n\
         \x20 mode tcp\n\
         \x20 option tcplog\n\
         \x20 timeout connect 5s\n\
         \x20 timeout client 1h\n\
         \x20 timeout server 1h\n",
    );

    render_proxy(&mut out, "kubernetes", KUBERNETES_API_PORT, addresses);
    render_proxy(&mut out, "talos", TALOS_API_PORT, addresses);

    out
}

fn render_proxy(out: &mut String, name: &str, port: u16, addresses: &[IpAddr]) {
    // Writing to a String cannot fail.
    let _ = write!(
        out,
        "\nfrontend {name}\n  bind :::{port} v4v6\n  default_backend {name}\n\
         \nbackend {name}\n  balance roundrobin\n  option tcp-check\n"
    );
    for (i, addr) in addresses.iter().enumerate() {
        let _ = writeln!(
            out,
            "  server {name}-{i} {} check",
            SocketAddr::new(*addr, port)
        );
    }
}

/// Write `contents` to `path` unless the file already holds exactly those
/// bytes.
///
/// Returns whether a write happened. A missing file counts as changed. The
/// write goes to a sibling temp file that is then renamed over `path`, so
/// readers never observe a partial config.
pub fn write_if_changed(path: &Path, contents: &[u8]) -> io::Result<bool> {
    match fs::read(path) {
        Ok(existing) if existing == contents => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let tmp = temp_path(path);
    fs::write(&tmp, contents)?;
    fs::set_permissions(&tmp, fs::Permissions::from_mode(CONFIG_MODE))?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    Ok(true)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
