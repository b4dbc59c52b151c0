use anyhow::Result;

use crate::cli::config::Config;
use crate::pending::PendingQueue;

pub fn execute_pending(config: Config) -> Result<()> {
    let queue = PendingQueue::open(&config.pending_dir)?;
    let paths = queue.list()?;

    println!("==> {} pending in {}", paths.len(), queue.dir().display());
    for path in paths {
        match PendingQueue::load(&path) {
            Ok(m) => println!("    {}", m),
            Err(e) => println!("    {} (unreadable: {})", path.display(), e),
        }
    }

    Ok(())
}
