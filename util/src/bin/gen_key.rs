use clap::{App, Arg};
use rand::prelude::*;
use zstick::{ConfigStore, NetworkKey, TomlStore};

fn main() {
    let matches = App::new("Network Key Generator")
        .version("1.0")
        .about("Generates a fresh network key and writes it to a key file.")
        .arg(
            Arg::with_name("KEY_FILE")
                .help("Path to the key file to (over)write")
                .required(true),
        )
        .get_matches();

    let key_file_path = matches.value_of("KEY_FILE").unwrap();

    let mut key = NetworkKey::zeroed();
    thread_rng().fill_bytes(&mut key[..]);

    let mut store = TomlStore::new(key_file_path);
    store
        .store_network_key(&key)
        .expect("Error writing the key file");

    println!("Wrote a new network key to `{}`", key_file_path);
}
