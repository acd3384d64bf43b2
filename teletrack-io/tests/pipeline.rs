#![allow(clippy::uninlined_format_args)]
use teletrack_algorithms::{process_events, SimulationConfig, Simulator, TrackingContext};
use teletrack_core::MetricsSink;
use teletrack_io::{HitFileReader, HitFileWriter, RecordWriter, RunConfig, SummarySink};
use tempfile::tempdir;

const RUN: &str = r#"{
    "layers": [
        { "id": 0, "z": 0.0, "radiation_length": 5.5e-4 },
        { "id": 1, "z": 150.0, "radiation_length": 5.5e-4 },
        { "id": 2, "z": 300.0, "radiation_length": 5.5e-4 },
        { "id": 3, "z": 600.0, "radiation_length": 5.5e-4 },
        { "id": 4, "z": 750.0, "radiation_length": 5.5e-4 },
        { "id": 5, "z": 900.0, "radiation_length": 5.5e-4 }
    ],
    "resolutions": { "0": [0.004] },
    "tracking": { "beam_energy": 120.0 }
}"#;

#[test]
fn simulated_run_through_files() {
    let dir = tempdir().unwrap();
    let config = RunConfig::from_json(RUN).unwrap();

    let sim = SimulationConfig::default()
        .with_events(50)
        .with_beam_energy(120.0);
    let events = Simulator::new(&config.geometry, sim).unwrap().run();

    let hits_path = dir.path().join("run.hits");
    let mut writer = HitFileWriter::create(&hits_path).unwrap();
    for (event, hits) in (0..).zip(&events) {
        writer.write_event(event, hits).unwrap();
    }
    writer.flush().unwrap();

    let reader = HitFileReader::open(&hits_path).unwrap();
    assert_eq!(reader.hit_count(), events.iter().map(Vec::len).sum::<usize>());
    let tables = reader.read_tables(&config.geometry);
    assert_eq!(tables.len(), 50);

    let ctx = TrackingContext::new(config.geometry, config.tracking, config.policy).unwrap();
    let records = RecordWriter::create(dir.path().join("mille.bin")).unwrap();
    let metrics = SummarySink::new();
    let stats = process_events(&ctx, &tables, &records, &metrics).unwrap();
    records.flush().unwrap();

    assert_eq!(stats.events, 50);
    assert!(stats.accepted > 40, "accepted {}", stats.accepted);
    assert_eq!(u64::try_from(records.records()).unwrap(), stats.records);

    // Walk the binary records by their word counts.
    let data = std::fs::read(dir.path().join("mille.bin")).unwrap();
    let mut offset = 0;
    let mut count = 0u64;
    while offset < data.len() {
        let words = i32::from_le_bytes(data[offset..offset + 4].try_into().unwrap());
        assert!(words > 0 && words % 2 == 0);
        offset += 4 + 4 * usize::try_from(words).unwrap();
        count += 1;
    }
    assert_eq!(offset, data.len());
    assert_eq!(count, stats.records);

    let probability = metrics.get("fit/probability").unwrap();
    assert!(probability.count >= stats.accepted);
    assert!(probability.min >= 0.0 && probability.max <= 1.0);
}

#[test]
fn csv_records_and_metrics_json() {
    let dir = tempdir().unwrap();
    let config = RunConfig::from_json(RUN).unwrap();
    let sim = SimulationConfig::default()
        .with_events(10)
        .with_beam_energy(120.0);
    let geometry = config.geometry.clone();
    let tables: Vec<_> = Simulator::new(&geometry, sim)
        .unwrap()
        .run()
        .iter()
        .zip(0..)
        .map(|(hits, event)| teletrack_core::HitTable::from_records(event, hits, &geometry))
        .collect();

    let ctx = TrackingContext::new(config.geometry, config.tracking, config.policy).unwrap();
    let records = RecordWriter::create(dir.path().join("records.csv")).unwrap();
    let metrics = SummarySink::new();
    let stats = process_events(&ctx, &tables, &records, &metrics).unwrap();
    records.flush().unwrap();
    assert!(stats.records > 0);

    let content = std::fs::read_to_string(dir.path().join("records.csv")).unwrap();
    let mut lines = content.lines();
    assert_eq!(lines.next(), Some(teletrack_io::CsvRecordWriter::HEADER));
    assert!(lines.all(|l| l.split(',').count() == 9));

    metrics.record("extra", &[1.0]);
    let path = dir.path().join("metrics.json");
    metrics.write_json(&path).unwrap();
    let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(json["extra"]["count"], 1);
    assert!(json.get("fit/chi2_ndf").is_some());
}
