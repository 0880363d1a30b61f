//! JSON persistence under `~/.pyps4-2ndscreen`, shared with the Python
//! tooling: saved credentials, the console list, and the title-name cache.
//! The protocol core never reads these; the CLI plumbs them in.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use directories::BaseDirs;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const CREDS_FILE: &str = ".ps4_creds.json";
const CONSOLES_FILE: &str = ".ps4_info.json";
const TITLES_FILE: &str = ".ps4_games.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredsFile {
    credentials: Option<String>,
}

pub fn config_dir() -> io::Result<PathBuf> {
    let base = BaseDirs::new()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no home directory"))?;
    Ok(base.home_dir().join(".pyps4-2ndscreen"))
}

fn load<T: DeserializeOwned + Default>(name: &str) -> io::Result<T> {
    let path = config_dir()?.join(name);
    match fs::read_to_string(&path) {
        Ok(text) if !text.trim().is_empty() => serde_json::from_str(&text)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err)),
        Ok(_) => Ok(T::default()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(err),
    }
}

fn save<T: Serialize>(name: &str, value: &T) -> io::Result<PathBuf> {
    let dir = config_dir()?;
    fs::create_dir_all(&dir)?;
    let path = dir.join(name);
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    fs::write(&path, text)?;
    Ok(path)
}

pub fn load_credentials() -> io::Result<Option<String>> {
    Ok(load::<CredsFile>(CREDS_FILE)?.credentials)
}

pub fn save_credentials(credentials: &str) -> io::Result<PathBuf> {
    save(
        CREDS_FILE,
        &CredsFile {
            credentials: Some(credentials.to_string()),
        },
    )
}

/// The console list maps IP address to credential.
pub fn load_consoles() -> io::Result<BTreeMap<String, String>> {
    load(CONSOLES_FILE)
}

pub fn save_console(ip: &str, credentials: &str) -> io::Result<PathBuf> {
    let mut consoles = load_consoles()?;
    consoles.insert(ip.to_string(), credentials.to_string());
    save(CONSOLES_FILE, &consoles)
}

/// The title cache maps title id to display name.
pub fn load_titles() -> io::Result<BTreeMap<String, String>> {
    load(TITLES_FILE)
}

pub fn record_title(title_id: &str, name: &str) -> io::Result<()> {
    let mut titles = load_titles()?;
    if titles.get(title_id).map(String::as_str) == Some(name) {
        return Ok(());
    }
    titles.insert(title_id.to_string(), name.to_string());
    save(TITLES_FILE, &titles)?;
    Ok(())
}
