use clap::{App, Arg};
use zcore::logging;
use zcore::logging::TraceLevel;
use zstick::{EngineConfig, MemoryStore, NetworkKey, Stick};

fn main() {
    let matches = App::new("Z-Wave Port Probe")
        .version("1.0")
        .about("Opens a serial port and queries the attached controller.")
        .arg(
            Arg::with_name("PORT")
                .help("Serial device path, e.g. /dev/ttyACM0")
                .required(true),
        )
        .arg(
            Arg::with_name("trace")
                .long("trace")
                .help("Enable high verbosity frame tracing"),
        )
        .get_matches();

    let port = matches.value_of("PORT").unwrap();

    let logger = logging::init();
    let store = Box::new(MemoryStore::new(NetworkKey::zeroed()));
    let mut stick = Stick::new(EngineConfig::default(), store, logger.clone());

    if matches.is_present("trace") {
        stick.set_trace_level(TraceLevel::High);
    }

    stick.open(port).expect("Error opening serial port");
    stick.set_serial_timeouts().expect("Error setting stick timeouts");

    let info = stick
        .query_controller_info()
        .expect("Error querying controller info");

    logging::info!(
        logger,
        "controller found";
        "home_id" => format!("{:08X}", info.home_id),
        "node_id" => info.node_id,
        "library" => &info.library_version,
        "library_type" => info.library_type,
        "app_version" => format!("{}.{}", info.app_version.0, info.app_version.1),
        "manufacturer" => format!("{:04X}", info.manufacturer_id),
        "product" => format!("{:04X}:{:04X}", info.product_type, info.product_id)
    );

    let suc = stick.query_suc_node_id().expect("Error querying SUC node id");
    logging::info!(logger, "suc state"; "suc_node" => suc);

    stick.close();
}
