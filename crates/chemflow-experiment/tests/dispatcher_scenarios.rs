use std::sync::Arc;
use std::time::Duration;

use chemflow_core::geometry::RackType;
use chemflow_core::{ConnectionState, Device, LabError};
use chemflow_experiment::{Command, Dispatcher, EngineState, LogEntry, MemoryRunLog, RunLogger};
use chemflow_hardware::drivers::mock::{
    MockLiquidHandler, MockPump, MockSyringePump, MockTemperatureController, MockValve,
};
use chemflow_hardware::registry::{DeviceCategory, DeviceHandle, DeviceRegistry};

struct Bench {
    pumps: Vec<Arc<MockPump>>,
    syringe: Arc<MockSyringePump>,
    valves: Vec<Arc<MockValve>>,
    tc: Arc<MockTemperatureController>,
    handler: Arc<MockLiquidHandler>,
    registry: Arc<DeviceRegistry>,
}

fn bench() -> Bench {
    let pumps: Vec<_> = (1..=3)
        .map(|i| Arc::new(MockPump::new(format!("Pump_{i}"))))
        .collect();
    let syringe = Arc::new(MockSyringePump::new("HarvardPump_1"));
    let valves = vec![
        Arc::new(MockValve::new("Valve_1", 6)),
        Arc::new(MockValve::new("Valve_2", 10)),
    ];
    let tc = Arc::new(MockTemperatureController::new("TC720_1", 25.0));
    let handler = Arc::new(MockLiquidHandler::new("GX281_1", RackType::R204).unwrap());

    let mut registry = DeviceRegistry::new();
    for pump in &pumps {
        registry
            .register(
                DeviceCategory::Pumps,
                pump.name(),
                DeviceHandle::flow_pump(pump.clone()),
            )
            .unwrap();
    }
    registry
        .register(
            DeviceCategory::Pumps,
            "HarvardPump_1",
            DeviceHandle::syringe_pump(syringe.clone()),
        )
        .unwrap();
    for valve in &valves {
        registry
            .register(
                DeviceCategory::Valves,
                valve.name(),
                DeviceHandle::valve(valve.clone()),
            )
            .unwrap();
    }
    registry
        .register(
            DeviceCategory::TemperatureControllers,
            "TC720_1",
            DeviceHandle::temperature(tc.clone()),
        )
        .unwrap();
    registry
        .register(
            DeviceCategory::LiquidHandlers,
            "GX281_1",
            DeviceHandle::liquid_handler(handler.clone()),
        )
        .unwrap();

    Bench {
        pumps,
        syringe,
        valves,
        tc,
        handler,
        registry: Arc::new(registry),
    }
}

fn dispatcher(bench: &Bench) -> (Dispatcher, Arc<MemoryRunLog>) {
    let log = Arc::new(MemoryRunLog::new());
    let dispatcher = Dispatcher::new(bench.registry.clone(), RunLogger::new(log.clone()));
    (dispatcher, log)
}

fn entries_for<'a>(entries: &'a [LogEntry], component: &str) -> Vec<&'a LogEntry> {
    entries.iter().filter(|e| e.component == component).collect()
}

#[tokio::test(start_paused = true)]
async fn pump_start_is_logged_and_stream_advances() {
    let bench = bench();
    let (mut dispatcher, log) = dispatcher(&bench);

    let summary = dispatcher
        .run(vec![
            Command::new("Pump", "dispense")
                .with_params("flow_rate=1000,volume=500,pump_id=1")
                .with_delay(Duration::from_millis(250)),
            Command::new("Temperature", "set_temperature").with_params("temp=30,temp_id=1"),
        ])
        .await
        .unwrap();

    let entries = log.entries();
    let pump = entries_for(&entries, "Pump");
    assert_eq!(pump.len(), 2);
    assert_eq!(pump[0].outcome, "Started async dispense on Pump_1");
    assert_eq!(pump[0].notes, "exp. 30.0 s");
    assert_eq!(pump[0].elapsed_s, 0.0);
    assert!(pump[1].outcome.starts_with("Dispensed 500.0 uL"));
    assert!(pump[1].elapsed_s >= 30.0);

    // the next command ran 0.25 s later, long before the pump finished
    let temperature = entries_for(&entries, "Temperature");
    assert_eq!(temperature[0].elapsed_s, 0.25);

    assert_eq!(summary.commands_executed, 2);
    assert_eq!(summary.background_completed, 1);
    assert_eq!(summary.state, EngineState::Finished);
    assert_eq!(bench.pumps[0].log().calls()[0], "pump dispense 1000 500");
}

#[tokio::test(start_paused = true)]
async fn sync_waits_for_slowest_pump_and_isolates_failures() {
    let bench = bench();
    bench.pumps[2].log().fail_on("pump");
    let (mut dispatcher, log) = dispatcher(&bench);

    let summary = dispatcher
        .run(vec![
            Command::new("Pump", "dispense").with_params("flow_rate=1000,volume=500,pump_id=1"),
            Command::new("Pump", "aspirating").with_params("flow_rate=1000,volume=100,pump_id=2"),
            Command::new("Pump", "dispense").with_params("flow_rate=500,volume=50,pump_id=3"),
            Command::sync(),
            Command::new("VICI-6Way", "move_home").with_params("valve_id=1"),
        ])
        .await
        .unwrap();

    let entries = log.entries();
    let sync = &entries_for(&entries, "SYNC")[0];
    assert_eq!(sync.outcome, "All pumps finished");
    assert_eq!(sync.notes, "3 joined: 2 completed, 1 failed");
    // Pump_1 started at 0 and needs 30 s
    assert_eq!(sync.elapsed_s, 30.0);

    let completions: Vec<_> = entries
        .iter()
        .filter(|e| e.component == "Pump" && !e.outcome.starts_with("Started"))
        .collect();
    assert_eq!(completions.len(), 3);
    // Pump_2 (6 s, started at 0.25) finished while Pump_1 was still running
    assert!(completions[0].outcome.contains("Pump_3") && completions[0].outcome.starts_with("Error"));
    assert!(completions[1].outcome.contains("Pump_2"));
    assert_eq!(completions[1].elapsed_s, 6.25);

    let valve = entries_for(&entries, "VICI-6Way");
    assert!(valve[0].elapsed_s > sync.elapsed_s);

    assert_eq!(summary.background_completed, 2);
    assert_eq!(summary.background_failed, 1);
    assert_eq!(summary.commands_executed, 5);
}

#[tokio::test]
async fn out_of_range_valve_position_is_rejected_locally() {
    let bench = bench();
    let (mut dispatcher, log) = dispatcher(&bench);

    let summary = dispatcher
        .run(vec![
            Command::new("VICI-6Way", "go_to_position")
                .with_params("position=41,valve_id=1")
                .with_delay(Duration::ZERO),
            Command::new("VICI-6Way", "go_to_position")
                .with_params("position=4,valve_id=1")
                .with_delay(Duration::ZERO),
        ])
        .await
        .unwrap();

    assert_eq!(summary.recoverable_failures, 1);
    let calls = bench.valves[0].log().calls();
    assert!(!calls.iter().any(|c| c == "go_to_position 41"));
    assert!(calls.iter().any(|c| c == "go_to_position 4"));

    let entries = log.entries();
    assert!(entries[0].outcome.starts_with("Error:"));
    let moves = log.with_action("go_to_position");
    assert_eq!(moves.len(), 2);
    assert_eq!(moves[1].outcome, "Moved Valve_1 to 4 (now 4)");
}

#[tokio::test]
async fn single_valve_command_writes_one_entry() {
    let bench = bench();
    let (mut dispatcher, log) = dispatcher(&bench);

    dispatcher
        .run(vec![
            Command::new("VICI-6Way", "go_to_position")
                .with_params("position=4,valve_id=1")
                .with_delay(Duration::ZERO),
            Command::new("VICI-6Way", "move_home")
                .with_params("valve_id=1")
                .with_delay(Duration::ZERO),
        ])
        .await
        .unwrap();

    let valve = entries_for(&log.entries(), "VICI-6Way")
        .into_iter()
        .cloned()
        .collect::<Vec<_>>();
    assert_eq!(valve.len(), 2);
    assert_eq!(valve[0].outcome, "Moved Valve_1 to 4 (now 4)");
    assert!(valve[1].outcome.starts_with("Homed Valve_1 (now "));
}

#[tokio::test]
async fn valve_broadcast_moves_every_valve() {
    let bench = bench();
    let (mut dispatcher, log) = dispatcher(&bench);

    dispatcher
        .run(vec![Command::new("VICI-10Way", "go_to_position")
            .with_params("position=5,valve_id=-1")
            .with_delay(Duration::ZERO)])
        .await
        .unwrap();

    for valve in &bench.valves {
        assert!(valve.log().calls().contains(&"go_to_position 5".to_string()));
    }
    let moves = log.with_action("go_to_position");
    assert_eq!(moves.len(), 2);
    assert!(moves.iter().all(|entry| entry.outcome.ends_with("to 5 (now 5)")));
}

#[tokio::test(start_paused = true)]
async fn unknown_component_and_bad_params_do_not_stop_the_run() {
    let bench = bench();
    let (mut dispatcher, log) = dispatcher(&bench);

    let summary = dispatcher
        .run(vec![
            Command::new("Centrifuge", "spin").with_delay(Duration::ZERO),
            Command::new("Pump", "dispense")
                .with_params("flow_rate=fast,volume=1,pump_id=1")
                .with_delay(Duration::ZERO),
            Command::new("Pump", "dispense")
                .with_params("flow_rate=100,volume=1,pump_id=7")
                .with_delay(Duration::ZERO),
            Command::new("Temperature", "set_temperature")
                .with_params("temp=40,temp_id=1")
                .with_delay(Duration::ZERO),
        ])
        .await
        .unwrap();

    // pump_id=7 falls back to the first flow pump
    assert_eq!(summary.recoverable_failures, 2);
    assert_eq!(summary.commands_executed, 2);
    assert!(log.entries()[0].outcome.contains("unknown component"));
    assert!(bench.tc.log().calls().contains(&"set_temperature 40".to_string()));
}

#[tokio::test]
async fn non_positive_pump_run_is_skipped() {
    let bench = bench();
    let (mut dispatcher, log) = dispatcher(&bench);

    let summary = dispatcher
        .run(vec![Command::new("Pump", "aspirate")
            .with_params("flow_rate=0,volume=500,pump_id=1")
            .with_delay(Duration::ZERO)])
        .await
        .unwrap();

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.recoverable_failures, 0);
    assert!(bench.pumps[0].log().calls().iter().all(|c| !c.starts_with("pump")));
    assert!(log.entries()[0].outcome.contains("on Pump_1 skipped"));
}

#[tokio::test]
async fn missing_pump_is_not_found_even_with_zero_rate() {
    let log = Arc::new(MemoryRunLog::new());
    let mut dispatcher = Dispatcher::new(
        Arc::new(DeviceRegistry::new()),
        RunLogger::new(log.clone()),
    );

    let summary = dispatcher
        .run(vec![Command::new("Pump", "aspirate")
            .with_params("flow_rate=0,volume=500,pump_id=1")
            .with_delay(Duration::ZERO)])
        .await
        .unwrap();

    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.recoverable_failures, 1);
    let entries = log.entries();
    assert!(entries[0].outcome.starts_with("Error:"));
    assert!(!entries[0].outcome.contains("skipped"));
}

#[tokio::test]
async fn fatal_device_error_closes_everything() {
    let bench = bench();
    bench.tc.log().fail_on("set_temperature");
    let (mut dispatcher, log) = dispatcher(&bench);

    let result = dispatcher
        .run(vec![
            Command::new("Temperature", "set_temperature")
                .with_params("temp=40,temp_id=1")
                .with_delay(Duration::ZERO),
            Command::new("VICI-6Way", "move_home").with_params("valve_id=1"),
        ])
        .await;

    assert!(matches!(result, Err(LabError::Hardware { .. })));
    assert_eq!(dispatcher.state(), EngineState::Failed);

    let abort = log.with_action("abort");
    assert_eq!(abort.len(), 1);
    assert!(abort[0].outcome.starts_with("Fatal:"));

    let valve_calls = bench.valves[0].log().calls();
    assert!(!valve_calls.contains(&"home".to_string()));
    assert!(valve_calls.contains(&"close".to_string()));
    assert_eq!(bench.handler.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn pause_holds_the_next_command_until_resume() {
    let bench = bench();
    let (mut dispatcher, log) = dispatcher(&bench);
    let control = dispatcher.control();
    control.pause();

    let run = tokio::spawn(async move {
        let summary = dispatcher
            .run(vec![Command::new("VICI-6Way", "move_home").with_params("valve_id=1")])
            .await;
        (dispatcher, summary)
    });

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(control.state(), EngineState::Paused);
    assert_eq!(log.with_action("pause").len(), 1);
    assert!(bench.valves[0].log().calls().is_empty());

    control.resume();
    let (dispatcher, summary) = run.await.unwrap();
    assert_eq!(summary.unwrap().commands_executed, 1);
    assert_eq!(dispatcher.state(), EngineState::Finished);
    assert!(bench.valves[0].log().calls().contains(&"home".to_string()));
}

#[tokio::test]
async fn liquid_handler_raises_before_well_moves() {
    let bench = bench();
    let (mut dispatcher, log) = dispatcher(&bench);

    dispatcher
        .run(vec![
            Command::new("GX-281", "move_home").with_delay(Duration::ZERO),
            Command::new("GX-281", "set_bedlayout")
                .with_params("bed=2,rack_layout=209")
                .with_delay(Duration::ZERO),
            Command::new("GX-281", "move_z_height")
                .with_params("height=40")
                .with_delay(Duration::ZERO),
            Command::new("GX-281", "move_xy")
                .with_params("bed=2,well=1")
                .with_delay(Duration::ZERO),
            Command::new("GX-281", "move_z")
                .with_params("bed=2,well=1")
                .with_delay(Duration::ZERO),
        ])
        .await
        .unwrap();

    let calls = bench.handler.log().calls();
    let travel_xy = calls.iter().position(|c| c.starts_with("travel_xy")).unwrap();
    assert_eq!(calls[travel_xy - 1], "travel_z 125");
    assert_eq!(calls.last().unwrap(), "close");
    // move_z lowered to the rack 209 well depth
    assert_eq!(calls[calls.len() - 2], "travel_z 86");
    assert!(log.entries()[1].outcome.contains("rack layout 209"));
}

#[tokio::test(start_paused = true)]
async fn syringe_stop_is_allowed_during_infusion() {
    let bench = bench();
    let (mut dispatcher, _log) = dispatcher(&bench);

    let summary = dispatcher
        .run(vec![
            Command::new("HarvardPump", "select_syringe").with_params("pump_id=1,syringe=10"),
            Command::new("HarvardPump", "infuse").with_params("pump_id=1,volume=100,rate=10"),
            Command::new("HarvardPump", "stop").with_params("pump_id=1"),
            Command::sync(),
        ])
        .await
        .unwrap();

    let calls = bench.syringe.log().calls();
    assert_eq!(calls, vec!["select_syringe 10", "infuse 100 10", "stop", "close"]);
    assert_eq!(summary.background_completed, 1);
}
