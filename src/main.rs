mod cli;
mod commands;
mod env_loader;
mod logging;

use plexcache_tier::error::TierError;

fn main() {
    env_loader::load_dotenv();

    if let Err(err) = cli::run() {
        eprintln!("error: {err:#}");
        if let Some(code) = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<TierError>())
            .map(TierError::code)
        {
            eprintln!("code={}", code.as_str());
        }
        std::process::exit(1);
    }
}
