//! Completed-mission spill: one directory per mission with the metadata
//! record and the sampled telemetry log. Nothing is written in flight, and
//! nothing here blocks a runtime thread: the CSV is built in memory and
//! both files go out through `tokio::fs`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use hub_proto::mission::MissionParams;
use hub_proto::telemetry::Snapshot;

/// Metadata written alongside the telemetry log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionRecord {
    pub mission_id: String,
    pub vehicle_id: u8,
    pub started_at_ms: i64,
    pub ended_at_ms: i64,
    pub params: MissionParams,
    pub total_items: u16,
    pub detections: u32,
}

/// One sampled row of the mission telemetry CSV.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRow {
    pub timestamp: i64,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub heading: f32,
    pub pitch: f32,
    pub roll: f32,
    pub groundspeed: f32,
    pub battery_voltage: f32,
    pub battery_percent: u8,
    pub mode: String,
    pub armed: bool,
    pub satellites: u8,
    pub hdop: f32,
}

impl TelemetryRow {
    pub fn sample(snap: &Snapshot) -> Self {
        Self {
            timestamp: snap.last_update_ms,
            lat: snap.latitude,
            lon: snap.longitude,
            alt: snap.altitude_m,
            heading: snap.heading_deg,
            pitch: snap.pitch_deg,
            roll: snap.roll_deg,
            groundspeed: snap.groundspeed_mps,
            battery_voltage: snap.battery_voltage_v,
            battery_percent: snap.battery_remaining_pct,
            mode: snap.flight_mode.clone(),
            armed: snap.armed,
            satellites: snap.gps.satellites_visible,
            hdop: snap.gps.hdop,
        }
    }
}

/// Writes `<data_dir>/<mission_id>/{metadata.json,telemetry.csv}`.
pub async fn write_mission(
    data_dir: &Path,
    record: &MissionRecord,
    rows: &[TelemetryRow],
) -> Result<PathBuf> {
    let dir = data_dir.join(&record.mission_id);
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("create mission dir {}", dir.display()))?;

    let meta = serde_json::to_vec_pretty(record).context("serialize mission metadata")?;
    fs::write(dir.join("metadata.json"), meta)
        .await
        .context("write mission metadata")?;

    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row).context("serialize telemetry row")?;
    }
    let csv_bytes = writer.into_inner().context("finish telemetry log")?;
    fs::write(dir.join("telemetry.csv"), csv_bytes)
        .await
        .context("write telemetry log")?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_proto::now_ms;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("hub-mission-test-{}", now_ms()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn writes_metadata_and_csv_with_the_full_column_set() {
        let data_dir = scratch_dir();
        let record = MissionRecord {
            mission_id: "mission_1730000000000".into(),
            vehicle_id: 1,
            started_at_ms: 1,
            ended_at_ms: 2,
            params: MissionParams::default(),
            total_items: 7,
            detections: 3,
        };
        let mut snap = Snapshot::default();
        snap.latitude = 23.295;
        snap.longitude = 85.31;
        snap.flight_mode = "AUTO".into();
        let rows = vec![TelemetryRow::sample(&snap)];

        let dir = write_mission(&data_dir, &record, &rows).await.unwrap();

        let meta: MissionRecord =
            serde_json::from_slice(&std::fs::read(dir.join("metadata.json")).unwrap()).unwrap();
        assert_eq!(meta.mission_id, record.mission_id);
        assert_eq!(meta.detections, 3);

        let csv_text = std::fs::read_to_string(dir.join("telemetry.csv")).unwrap();
        let header = csv_text.lines().next().unwrap();
        assert_eq!(
            header,
            "timestamp,lat,lon,alt,heading,pitch,roll,groundspeed,battery_voltage,\
             battery_percent,mode,armed,satellites,hdop"
        );
        assert!(csv_text.lines().nth(1).unwrap().contains("23.295"));

        std::fs::remove_dir_all(&data_dir).ok();
    }
}
