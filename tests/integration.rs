use power_observer::attribution::{AttributionConfig, TaskGrouping};
use power_observer::daemon::{Daemon, DaemonConfig, DaemonState};
use power_observer::errors::{DaemonError, SampleError, SamplerExit};
use power_observer::exporters::{DisplayNameEnricher, Report, StaticIdentity, DISPLAY_NAME};
use power_observer::selection::OBSERVER_LABEL;
use power_observer::sensors::battery::NoBattery;
use power_observer::sensors::debug::DebugSensor;
use std::io::Write;
use std::time::Duration;

const OBSERVER_PID: i32 = 777;

/// A sampler document with one coalition per entry of `coalitions`
/// (bundle id, energy impact, member pids). The members share the coalition's
/// energy impact evenly.
fn document(coalitions: &[(&str, f64, Vec<i32>)]) -> String {
    let mut text = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n\
         <plist version=\"1.0\">\n<dict>\n\
         \t<key>is_delta</key><true/>\n\
         \t<key>elapsed_ns</key><integer>5000000000</integer>\n\
         \t<key>coalitions</key>\n\t<array>\n",
    );
    let mut total = 0.0;
    for (id, (name, impact, pids)) in coalitions.iter().enumerate() {
        total += impact;
        text.push_str(&format!(
            "\t<dict>\n\t\t<key>id</key><integer>{id}</integer>\n\t\t<key>name</key><string>{name}</string>\n\t\t<key>energy_impact</key><real>{impact:?}</real>\n\t\t<key>tasks</key>\n\t\t<array>\n"
        ));
        let member_impact = impact / pids.len().max(1) as f64;
        for pid in pids.iter() {
            text.push_str(&format!(
                "\t\t\t<dict><key>pid</key><integer>{pid}</integer><key>name</key><string>{name}</string><key>energy_impact</key><real>{member_impact:?}</real></dict>\n"
            ));
        }
        text.push_str("\t\t</array>\n\t</dict>\n");
    }
    text.push_str(&format!(
        "\t</array>\n\t<key>all_tasks</key>\n\t<dict><key>energy_impact</key><real>{total:?}</real></dict>\n\
         \t<key>processor</key>\n\t<dict><key>combined_power</key><real>3000.0</real></dict>\n\
         </dict>\n</plist>\n"
    ));
    text
}

fn fifteen_coalitions(observer_rank: usize) -> String {
    let names: Vec<String> = (0..15).map(|i| format!("com.example.app_{i}")).collect();
    let coalitions: Vec<(&str, f64, Vec<i32>)> = (0..15)
        .map(|i| {
            let pid = if i == observer_rank { OBSERVER_PID } else { 1000 + i as i32 };
            (names[i].as_str(), 150.0 - 10.0 * i as f64, vec![pid])
        })
        .collect();
    document(&coalitions)
}

fn config() -> DaemonConfig {
    DaemonConfig {
        interval: Duration::from_secs(1),
        attribution: AttributionConfig::default(),
        max_top_consumers: 10,
        observer_pid: OBSERVER_PID,
        observer_name: None,
    }
}

fn daemon(sensor: DebugSensor) -> Daemon {
    Daemon::new(Box::new(sensor), Box::new(NoBattery), config())
        .with_identity(Box::new(StaticIdentity(String::from("integration"))))
        .with_enricher(Box::new(DisplayNameEnricher))
}

#[test]
fn daemon_survives_a_malformed_sample() {
    let valid = fifteen_coalitions(2);
    let truncated_value = "<plist version=\"1.0\">\n<dict>\n<key>elapsed_ns</key><integer>12ab</integer>\n</dict>\n</plist>\n";
    let output = format!("{valid}\0{truncated_value}\0{valid}");
    let mut daemon = daemon(DebugSensor::new(output));
    daemon.start().unwrap();

    let mut reports: Vec<Report> = vec![];
    let mut sink = |r: &Report| reports.push(r.clone());
    let outcomes: Vec<_> = (0..3).map(|_| daemon.next_window(&mut sink)).collect();
    assert!(matches!(outcomes[0], Some(Ok(_))));
    assert!(matches!(outcomes[1], Some(Err(SampleError::Malformed(_)))));
    assert!(matches!(outcomes[2], Some(Ok(_))));
    assert_eq!(daemon.state(), DaemonState::Sampling);
    assert_eq!(daemon.diagnostics().len(), 1);
    assert_eq!(reports.len(), 2);
}

#[test]
fn reports_keep_top_ten_and_the_observer() {
    for rank in [2, 14] {
        let mut daemon = daemon(DebugSensor::new(fifteen_coalitions(rank)));
        let mut reports: Vec<Report> = vec![];
        let result = daemon.run(&mut |r: &Report| reports.push(r.clone()));
        assert!(matches!(result, Err(DaemonError::SamplerExited(_))));
        assert_eq!(reports.len(), 1);

        let tasks = &reports[0].tasks;
        assert_eq!(tasks.len(), 11);
        let observer = tasks.last().unwrap();
        assert_eq!(observer.name, OBSERVER_LABEL);
        assert_eq!(observer.pid, Some(OBSERVER_PID));
        assert!(observer.member_pids.is_empty());
        // Its coalition stays ranked when it makes the top ten.
        let ranked = tasks[..10].iter().any(|t| t.has_pid(OBSERVER_PID));
        assert_eq!(ranked, rank < 10);
        assert_eq!(tasks[0].metadata[DISPLAY_NAME], "Example App 0");
        // 3000 mW over 5 s
        assert!((reports[0].total_energy - 15.0).abs() < 1e-9);
        // The impacts sum to 1200.
        let expected = (150.0 - 10.0 * rank as f64) / 1200.0 * 15.0;
        assert!((observer.energy - expected).abs() < 1e-9);
    }
}

#[test]
fn observer_inside_a_larger_coalition() {
    let output = document(&[
        ("com.apple.Terminal", 90.0, vec![500, OBSERVER_PID]),
        ("kernel_task", 10.0, vec![0]),
    ]);
    let mut daemon = daemon(DebugSensor::new(output));
    daemon.start().unwrap();
    let report = daemon.next_window(&mut |_: &Report| {}).unwrap().unwrap();

    let names: Vec<&str> = report.tasks.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["com.apple.Terminal", "kernel_task", OBSERVER_LABEL]);
    // 15 J shared 90/10, the observer being half of the terminal.
    assert!((report.tasks[0].energy - 13.5).abs() < 1e-9);
    assert!((report.tasks[1].energy - 1.5).abs() < 1e-9);
    assert!((report.tasks[2].energy - 6.75).abs() < 1e-9);
    assert_eq!(report.tasks[2].pid, Some(OBSERVER_PID));
}

#[test]
fn zero_activity_sample_yields_zero_energies() {
    let idle = document(&[("com.apple.Safari", 0.0, vec![1]), ("kernel_task", 0.0, vec![0])]);
    let mut daemon = daemon(DebugSensor::new(idle));
    daemon.start().unwrap();
    let report = daemon.next_window(&mut |_: &Report| {}).unwrap().unwrap();
    assert_eq!(report.tasks.len(), 2);
    assert!(report.tasks.iter().all(|t| t.energy == 0.0));
    assert!(daemon.diagnostics().is_empty());
}

#[test]
fn per_process_grouping() {
    let mut config = config();
    config.attribution.grouping = TaskGrouping::Tasks;
    let output = document(&[("com.apple.Safari", 30.0, vec![10, 11]), ("kernel_task", 10.0, vec![0])]);
    let mut daemon = Daemon::new(
        Box::new(DebugSensor::new(output)),
        Box::new(NoBattery),
        config,
    )
    .with_identity(Box::new(StaticIdentity(String::from("integration"))));
    daemon.start().unwrap();
    let report = daemon.next_window(&mut |_: &Report| {}).unwrap().unwrap();
    let pids: Vec<Option<i32>> = report.tasks.iter().map(|t| t.pid).collect();
    assert_eq!(pids, vec![Some(10), Some(11), Some(0)]);
}

#[test]
fn sampler_exit_is_reported_with_its_stderr() {
    let exit = SamplerExit {
        code: Some(1),
        stderr: String::from("powermetrics must be invoked as the superuser"),
    };
    let mut daemon = daemon(DebugSensor::new(fifteen_coalitions(0)).with_exit(exit.clone()));
    let mut delivered = 0;
    match daemon.run(&mut |_: &Report| delivered += 1) {
        Err(DaemonError::SamplerExited(reported)) => assert_eq!(reported, exit),
        _ => panic!("expected SamplerExited"),
    }
    assert_eq!(delivered, 1);
    assert_eq!(daemon.state(), DaemonState::Stopped);
    assert_eq!(daemon.sampler_exit(), Some(&exit));
}

#[test]
fn recording_replayed_from_a_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}\0{}", fifteen_coalitions(3), fifteen_coalitions(4)).unwrap();
    let mut daemon = daemon(DebugSensor::from_file(file.path()));
    let mut reports = 0;
    let _ = daemon.run(&mut |_: &Report| reports += 1);
    assert_eq!(reports, 2);
}
