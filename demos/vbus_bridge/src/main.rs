use std::{collections::HashMap, sync::Arc};

use async_std::task;

use clap::{App, Arg};

use log::{info, warn};

use serde::Deserialize;

use vbus_bridge::{
    BindingProvider, Error, EventPublisher, Providers, RawOptions, Result, VBusBinding, Value,
};

fn wrap_err<T, E: std::fmt::Debug>(message: &str, err: E) -> Result<T> {
    Err(Error::Config(format!("{}: {:?}", message, err)))
}

#[derive(Debug, Clone, Deserialize)]
struct Item {
    name: String,
    field: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BridgeFile {
    resources: Option<String>,
    options: RawOptions,
    items: Vec<Item>,
}

#[derive(Debug)]
struct LogPublisher;

impl EventPublisher for LogPublisher {
    fn post_update(&self, item_name: &str, value: Value) {
        info!("{} = {}", item_name, value);
    }
}

#[derive(Debug)]
struct ItemTable {
    items: Vec<Item>,
}

impl BindingProvider for ItemTable {
    fn item_names(&self) -> Vec<String> {
        self.items.iter().map(|item| item.name.clone()).collect()
    }

    fn field_name(&self, item_name: &str) -> Option<String> {
        self.items
            .iter()
            .find(|item| item.name == item_name)
            .map(|item| item.field.clone())
    }
}

fn options_to_properties(options: &RawOptions) -> HashMap<String, String> {
    let pairs = vec![
        ("host", &options.host),
        ("port", &options.port),
        ("password", &options.password),
        ("serialport", &options.serialport),
        ("refresh", &options.refresh),
        ("updateinterval", &options.updateinterval),
        ("deviceid", &options.deviceid),
    ];

    pairs
        .into_iter()
        .filter_map(|(key, value)| value.as_ref().map(|value| (key.to_string(), value.clone())))
        .collect()
}

async fn run_main_loop() -> Result<()> {
    let option_names = [
        "host",
        "port",
        "password",
        "serialport",
        "refresh",
        "updateinterval",
        "deviceid",
    ];

    let mut app = App::new("vbus_bridge")
        .version("0.1")
        .about("Receive RESOL VBus data and log the values of configured items")
        .arg(Arg::with_name("config")
            .long("config")
            .value_name("FILE")
            .help("Set a bridge TOML filename")
            .takes_value(true))
        .arg(Arg::with_name("resources")
            .long("resources")
            .value_name("DIR")
            .help("Set the directory containing mapping.cfg and the device definitions")
            .takes_value(true))
        .arg(Arg::with_name("item")
            .long("item")
            .value_name("NAME=FIELD")
            .help("Bind an item to a field")
            .takes_value(true)
            .multiple(true));

    for name in option_names.iter() {
        app = app.arg(Arg::with_name(name)
            .long(name)
            .takes_value(true));
    }

    let matches = app.get_matches();

    let mut file = match matches.value_of("config") {
        Some(filename) => {
            let text = std::fs::read_to_string(filename)?;
            match toml::from_str::<BridgeFile>(&text) {
                Ok(file) => file,
                Err(err) => return wrap_err("Unable to parse bridge TOML file", err),
            }
        }
        None => BridgeFile::default(),
    };

    let mut properties = options_to_properties(&file.options);
    for name in option_names.iter() {
        if let Some(value) = matches.value_of(name) {
            properties.insert(name.to_string(), value.to_string());
        }
    }

    if let Some(items) = matches.values_of("item") {
        for item in items {
            let idx = match item.find('=') {
                Some(idx) => idx,
                None => return wrap_err("Item must be NAME=FIELD", item),
            };
            file.items.push(Item {
                name: item[0..idx].to_string(),
                field: item[idx + 1..].to_string(),
            });
        }
    }

    if file.items.is_empty() {
        warn!("No items configured, nothing will be published");
    }

    let resources = matches
        .value_of("resources")
        .map(str::to_string)
        .or(file.resources)
        .unwrap_or_else(|| "resources".to_string());

    let providers = Providers::new();
    providers.add(Arc::new(ItemTable { items: file.items }));

    let binding = VBusBinding::new(resources, providers, Arc::new(LogPublisher));
    binding.activate(&properties).await?;

    info!(
        "{} running in {:?} mode, ticking every {:?}",
        binding.name(),
        binding.run_mode(),
        binding.refresh_interval()
    );

    loop {
        task::sleep(binding.refresh_interval()).await;

        // Failures are logged by the binding; keep ticking.
        drop(binding.execute().await);

        if let Some(err) = binding.last_cycle_error() {
            warn!("Device not reachable: {}", err);
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();

    task::block_on(run_main_loop())
}
