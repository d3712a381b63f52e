use std::env;
use std::path::PathBuf;

fn fallback_dotenv_path(plexcache_home: Option<PathBuf>, home_dir: Option<PathBuf>) -> Option<PathBuf> {
    match (plexcache_home, home_dir) {
        (Some(home), _) => Some(home.join(".env")),
        (None, Some(home)) => Some(home.join("plexcache/.env")),
        (None, None) => None,
    }
}

pub fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    let fallback = fallback_dotenv_path(
        env::var_os("PLEXCACHE_HOME").map(PathBuf::from),
        dirs::home_dir(),
    );

    let Some(path) = fallback else {
        return;
    };
    if path.is_file() {
        let _ = dotenvy::from_path(&path);
    }
}

#[cfg(test)]
mod tests {
    use super::fallback_dotenv_path;
    use std::path::PathBuf;

    #[test]
    fn fallback_prefers_plexcache_home() {
        let got = fallback_dotenv_path(
            Some(PathBuf::from("/srv/plexcache")),
            Some(PathBuf::from("/home/alice")),
        );
        assert_eq!(got, Some(PathBuf::from("/srv/plexcache/.env")));
    }

    #[test]
    fn fallback_uses_home_when_plexcache_home_unset() {
        let got = fallback_dotenv_path(None, Some(PathBuf::from("/home/alice")));
        assert_eq!(got, Some(PathBuf::from("/home/alice/plexcache/.env")));
    }

    #[test]
    fn no_home_means_no_fallback() {
        assert_eq!(fallback_dotenv_path(None, None), None);
    }
}
