use clap::{App, Arg};
use d2dcn::logging;
use d2dcn::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Publishes an `add` command on one node and calls it from a second node
/// sharing the same in-process broker hub.
pub fn main() {
    let matches = App::new("Command demo")
        .about("Registers a two-argument add command and invokes it.")
        .arg(Arg::with_name("ARG1").help("First addend").required(true))
        .arg(Arg::with_name("ARG2").help("Second addend").required(true))
        .get_matches();

    let arg1: i64 = matches
        .value_of("ARG1")
        .unwrap()
        .parse()
        .expect("ARG1 must be an integer");
    let arg2: i64 = matches
        .value_of("ARG2")
        .unwrap()
        .parse()
        .expect("ARG2 must be an integer");

    let log = logging::init();

    let hub = MemoryHub::new();
    let publisher = Node::new(
        hub.client("publisher") as Arc<dyn SharedTable>,
        Some("demo_publisher"),
        &log,
    );
    let caller = Node::new(
        hub.client("caller") as Arc<dyn SharedTable>,
        Some("demo_caller"),
        &log,
    );
    publisher.start();
    caller.start();

    let mut input = FieldSchema::new();
    input.insert("arg1".to_string(), FieldDef::mandatory(ValueType::Int));
    input.insert("arg2".to_string(), FieldDef::mandatory(ValueType::Int));

    let mut output = FieldSchema::new();
    output.insert("sum".to_string(), FieldDef::mandatory(ValueType::Int));

    let registered = publisher.add_service_command(
        |args| {
            let arg1 = args.get("arg1").and_then(|v| v.as_i64()).unwrap_or(0);
            let arg2 = args.get("arg2").and_then(|v| v.as_i64()).unwrap_or(0);
            json!({ "sum": arg1 + arg2 })
        },
        "add",
        input,
        output,
        d2dcn::category::GENERIC,
        true,
        5,
        CommandProtocol::JsonUdp,
    );

    logging::info!(log, "command published"; "name" => "add", "registered" => registered);

    let proxy = caller
        .get_available_commands("add", "", "", "", Some(Duration::from_secs(5)))
        .pop()
        .expect("add command not discovered");

    let mut args = serde_json::Map::new();
    args.insert("arg1".to_string(), json!(arg1));
    args.insert("arg2".to_string(), json!(arg2));

    let response = proxy.call(&args, None);
    match response.success() {
        true => println!("{} + {} = {}", arg1, arg2, response.get("sum").unwrap()),
        false => println!("call failed: {}", response.error().unwrap_or("unknown")),
    }

    // Disabled commands answer with a typed error instead of going dark.
    publisher.enable_command("add", false);
    let response = proxy.call(&args, None);
    println!("after disable: {}", response.error().unwrap_or("ok"));
}
