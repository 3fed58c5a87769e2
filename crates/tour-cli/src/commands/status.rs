//! `tour-term status`: show the saved session id.

use std::path::Path;

use anyhow::Result;
use tour_client::{FileSessionStore, SessionStore};

pub fn run(state_file: &Path) -> Result<()> {
    let store = FileSessionStore::new(state_file);
    print!("{}", describe(&store));
    Ok(())
}

fn describe(store: &FileSessionStore) -> String {
    match store.load() {
        Some(id) => format!("session: {id}\nstate file: {}\n", store.path().display()),
        None => format!("No saved session ({}).\n", store.path().display()),
    }
}
