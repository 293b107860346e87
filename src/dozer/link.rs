// Dozer - Duty-cycled temperature and humidity reporter
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use std::fs;
use std::path::PathBuf;

const SYSFS_NET: &str = "/sys/class/net";

/// Whether the network link is up and able to carry a payload. Polled, never pushed.
pub trait LinkStatus {
    fn is_link_ready(&mut self) -> bool;
}

/// `LinkStatus` based on the operational state the kernel reports for a network
/// interface, e.g. `/sys/class/net/wlan0/operstate`.
#[derive(Debug, Clone)]
pub struct InterfaceLink {
    interface: String,
    path: PathBuf,
}

impl InterfaceLink {
    pub fn new(interface: &str) -> Self {
        Self::with_root(interface, SYSFS_NET)
    }

    fn with_root<P: Into<PathBuf>>(interface: &str, root: P) -> Self {
        let mut path = root.into();
        path.push(interface);
        path.push("operstate");

        Self {
            interface: interface.to_owned(),
            path,
        }
    }
}

impl LinkStatus for InterfaceLink {
    fn is_link_ready(&mut self) -> bool {
        match fs::read_to_string(&self.path) {
            Ok(state) => {
                let state = state.trim();
                tracing::debug!(message = "interface state", interface = %self.interface, state = state);
                state == "up"
            }
            Err(e) => {
                tracing::debug!(
                    message = "unable to read interface state",
                    interface = %self.interface,
                    path = %self.path.display(),
                    error = %e,
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{InterfaceLink, LinkStatus};
    use std::fs;
    use std::path::PathBuf;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dozer-link-{}-{}", name, std::process::id()));
        fs::create_dir_all(dir.join("wlan0")).unwrap();
        dir
    }

    #[test]
    fn test_link_up() {
        let root = scratch_dir("up");
        fs::write(root.join("wlan0").join("operstate"), "up\n").unwrap();

        let mut link = InterfaceLink::with_root("wlan0", &root);
        assert!(link.is_link_ready());

        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_link_down() {
        let root = scratch_dir("down");
        fs::write(root.join("wlan0").join("operstate"), "dormant\n").unwrap();

        let mut link = InterfaceLink::with_root("wlan0", &root);
        assert!(!link.is_link_ready());

        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_link_missing_interface() {
        let root = scratch_dir("missing");

        let mut link = InterfaceLink::with_root("eth7", &root);
        assert!(!link.is_link_ready());

        fs::remove_dir_all(root).unwrap();
    }
}
