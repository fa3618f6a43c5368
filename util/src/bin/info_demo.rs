use clap::{App, Arg};
use d2dcn::logging;
use d2dcn::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Publishes a counter info value on one node and watches it from a second
/// node sharing the same in-process broker hub.
pub fn main() {
    let matches = App::new("Info demo")
        .about("Publishes a counter and follows its updates.")
        .arg(
            Arg::with_name("COUNT")
                .help("How many updates to publish")
                .default_value("5"),
        )
        .get_matches();

    let count: i64 = matches
        .value_of("COUNT")
        .unwrap()
        .parse()
        .expect("COUNT must be an integer");

    let log = logging::init();

    let hub = MemoryHub::new();
    let publisher = Node::new(
        hub.client("publisher") as Arc<dyn SharedTable>,
        Some("demo_publisher"),
        &log,
    );
    let watcher = Node::new(
        hub.client("watcher") as Arc<dyn SharedTable>,
        Some("demo_watcher"),
        &log,
    );
    publisher.start();
    watcher.start();

    let counter = publisher
        .add_info_writer("counter", ValueType::Int, d2dcn::category::GENERIC, d2dcn::INFO_PROTOCOL_ASCII)
        .expect("writer setup failed");

    let reader = watcher
        .get_available_info_readers("counter", "", "", "", Some(Duration::from_secs(5)))
        .pop()
        .expect("counter info not discovered");

    reader.add_on_update_callback(|value| match value {
        Some(value) => println!("update: {:?}", value),
        None => println!("writer went offline"),
    });

    for tick in 1..=count {
        counter.set_value(Value::Int(tick));
        thread::sleep(Duration::from_millis(500));
    }

    logging::info!(log, "removing writer"; "name" => "counter");
    publisher.remove_info_writer("counter");
    thread::sleep(Duration::from_millis(500));

    println!("reader online: {}", reader.online());
}
