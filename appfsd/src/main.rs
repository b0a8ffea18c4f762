//! `appfsd`: the package daemon. Registers a well-known name on the
//! session bus and answers `GetPackage(name) -> path` out of an in-memory
//! map built by scanning a directory of `.appfs` package files at
//! startup. A caller of the core, not part of it.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use zbus::{connection, interface};

struct Daemon {
    packages: Mutex<HashMap<String, String>>,
}

#[interface(name = "org.appfs.Daemon1")]
impl Daemon {
    /// Returns the path of the installed package with application name
    /// `name`, or an empty string if none is registered.
    async fn get_package(&self, name: String) -> String {
        self.packages
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .unwrap_or_default()
    }

    /// Lists the application names currently registered.
    async fn list_packages(&self) -> Vec<String> {
        self.packages.lock().unwrap().keys().cloned().collect()
    }
}

/// Scans `dir` for `.appfs` files and reads each one's declared app name
/// out of its filesystem-info block, building the name -> path map.
fn scan_packages(dir: &PathBuf) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            log::warn!("cannot scan package directory {dir:?}: {e}");
            return map;
        }
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("appfs") {
            continue;
        }
        match appfs::pathfs::PathFs::open_package(&path) {
            Ok(pkg) => match pkg.engine().app_name() {
                Ok(name) => {
                    let name = String::from_utf8_lossy(&name).into_owned();
                    if !name.is_empty() {
                        map.insert(name, path.to_string_lossy().into_owned());
                    }
                }
                Err(e) => log::warn!("skipping {path:?}: {e}"),
            },
            Err(e) => log::warn!("skipping {path:?}: {e}"),
        }
    }
    map
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let dir = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/var/lib/appfs/packages"));

    let packages = scan_packages(&dir);
    log::info!("registered {} package(s) from {:?}", packages.len(), dir);

    let daemon = Daemon {
        packages: Mutex::new(packages),
    };

    let _conn = connection::Builder::session()?
        .name("org.appfs.Daemon")?
        .serve_at("/org/appfs/Daemon", daemon)?
        .build()
        .await?;

    // Park forever; zbus services requests on its own executor tasks.
    std::future::pending::<()>().await;
    Ok(())
}
