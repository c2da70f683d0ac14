//! Configuration loading tests.

mod test_helper;

use config::Config;
use std::io::Write;
use tempfile::Builder;
use test_helper::*;
use textrelay::prelude::*;

fn load(contents: &str) -> (Config, tempfile::NamedTempFile) {
    let mut file = Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("Failed to create temp file");
    file.write_all(contents.as_bytes())
        .expect("Failed to write config");

    let config = Config::builder()
        .add_source(config::File::from(file.path()))
        .build()
        .expect("Failed to load config");
    (config, file)
}

#[test]
fn named_settings_override_global_ones() {
    init_tracing();
    let (config, _file) = load(
        r#"
max_connections = 5

[small_relay]
max_connections = 1
"#,
    );

    let mut server = RelayServer::bind_named(&config, "small_relay", "127.0.0.1:0").unwrap();
    let _first = connect_clients(&mut server, 1);

    let extra = connect(server.local_addr());
    let extra_addr = extra.local_addr().unwrap();
    pump_until(&mut server, |_, events| {
        events.contains(&ServerEvent::Rejected {
            peer_addr: extra_addr,
        })
    });
    assert_eq!(server.registry().len(), 1);

    // Unnamed lookups fall back to the global key
    let mut server = RelayServer::bind_named(&config, "other_relay", "127.0.0.1:0").unwrap();
    let clients = connect_clients(&mut server, 3);
    assert_eq!(clients.len(), 3);
    assert_eq!(server.registry().len(), 3);
}

#[test]
fn read_size_comes_from_file() {
    init_tracing();
    let (config, _file) = load("max_read_size = 4\n");

    let mut server = RelayServer::bind(&config, "127.0.0.1:0").unwrap();
    let mut clients = connect_clients(&mut server, 2);
    let (_b, _) = clients.pop().unwrap();
    let (mut a, id_a) = clients.pop().unwrap();

    a.write_all(b"abcdef").unwrap();
    let events = pump_until(&mut server, |_, events| {
        events
            .iter()
            .filter_map(|event| match event {
                ServerEvent::Message { id, text } if *id == id_a => Some(text.len()),
                _ => None,
            })
            .sum::<usize>()
            == 6
    });

    for event in events {
        if let ServerEvent::Message { text, .. } = event {
            assert!(text.len() <= 4);
        }
    }
}

#[test]
fn malformed_config_file_is_reported() {
    let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(b"max_read_size = [").unwrap();

    let result = Config::builder()
        .add_source(config::File::from(file.path()))
        .build();
    assert!(result.is_err());

    let err = Error::from(result.unwrap_err());
    assert!(matches!(err, Error::Config(_)));
    assert!(!err.is_fatal());
}
