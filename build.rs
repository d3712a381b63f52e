use std::collections::BTreeSet;
use std::env;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::time::SystemTime;
use walkdir::WalkDir;

const ENV_PREFIX: &str = "PLEXCACHE_";

/// Names that share the prefix but are not environment variables.
const NOT_ENV: &[&str] = &["PLEXCACHE_WARN"];

/// Every `PLEXCACHE_*` identifier mentioned in the crate's sources.
fn env_keys(src: &Path) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    let sources = WalkDir::new(src)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "rs"));
    for entry in sources {
        let Ok(content) = fs::read_to_string(entry.path()) else {
            continue;
        };
        for (start, _) in content.match_indices(ENV_PREFIX) {
            let key: String = content[start..]
                .chars()
                .take_while(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || *c == '_')
                .collect();
            if key.len() > ENV_PREFIX.len() && !NOT_ENV.contains(&key.as_str()) {
                keys.insert(key);
            }
        }
    }
    keys
}

fn main() {
    let mut generated = String::from("pub const GENERATED_PLEXCACHE_ENV_ALLOWLIST: &[&str] = &[\n");
    for key in env_keys(Path::new("src")) {
        let _ = writeln!(generated, "    \"{key}\",");
    }
    generated.push_str("];\n");

    let out_dir = env::var("OUT_DIR").expect("OUT_DIR is set by cargo");
    fs::write(Path::new(&out_dir).join("plexcache_env_allowlist.rs"), generated)
        .expect("write env allowlist");

    let since_epoch = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system clock is after UNIX_EPOCH");
    println!(
        "cargo:rustc-env=BUILD_UUID={:x}-{:x}-{:x}",
        since_epoch.as_secs(),
        since_epoch.subsec_nanos(),
        std::process::id()
    );
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src");
}
