use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use ulid::Ulid;

use timeline_validator::model::{TimelineItem, WriteEvent};
use timeline_validator::notify::NotifyHub;
use timeline_validator::store::{InMemoryStore, ItemStore, JournaledStore};
use timeline_validator::trigger::TriggerHandler;

const HOUR: i64 = 3_600_000; // 1 hour in ms

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn stamp(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms).unwrap().to_rfc3339()
}

fn item(id: String, start_ms: i64, deps: Vec<String>, resources: Vec<String>) -> TimelineItem {
    TimelineItem {
        id,
        start_date: stamp(start_ms),
        end_date: stamp(start_ms + HOUR),
        dependencies: deps,
        assigned_resource_ids: resources,
        ..Default::default()
    }
}

/// Store the item and fire the trigger; returns the time spent in both.
async fn write(store: &dyn ItemStore, handler: &TriggerHandler, project: &str, it: TimelineItem) -> Duration {
    let t = Instant::now();
    let before = store.put_item(project, it.clone()).await.unwrap();
    let event = WriteEvent {
        project_id: project.to_string(),
        item_id: it.id.clone(),
        before,
        after: Some(it),
    };
    handler.handle(&event).await.unwrap();
    t.elapsed()
}

async fn phase1_chain(n: usize) {
    let store = Arc::new(InMemoryStore::new());
    let handler = TriggerHandler::new(store.clone(), Arc::new(NotifyHub::new()));
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let deps = if i == 0 { vec![] } else { vec![format!("t{}", i - 1)] };
        let it = item(format!("t{i}"), i as i64 * HOUR, deps, vec![]);
        latencies.push(write(store.as_ref(), &handler, "chain", it).await);
    }

    let elapsed = start.elapsed();
    println!("  {n} chained writes in {:.2}s", elapsed.as_secs_f64());
    print_latency("write+validate latency", &mut latencies);

    // Close the ring: the first item now depends on the last.
    let closing = item("t0".into(), 0, vec![format!("t{}", n - 1)], vec![]);
    let mut ring = vec![write(store.as_ref(), &handler, "chain", closing).await];
    print_latency("ring-closing write", &mut ring);
}

async fn phase2_hotspot(projects: usize, per_project: usize) {
    let store = Arc::new(InMemoryStore::new());
    let handler = TriggerHandler::new(store.clone(), Arc::new(NotifyHub::new()));
    let hot = vec!["hot-resource".to_string()];
    let mut latencies = Vec::with_capacity(projects * per_project);

    for p in 0..projects {
        let project = format!("proj-{p}");
        for _ in 0..per_project {
            // Every booking overlaps the same hour on one resource.
            let it = item(Ulid::new().to_string(), 0, vec![], hot.clone());
            latencies.push(write(store.as_ref(), &handler, &project, it).await);
        }
    }

    println!("  {} bookings on one resource", projects * per_project);
    print_latency("write+validate latency", &mut latencies);
}

async fn phase3_concurrent_journaled(n_tasks: usize, n_per_task: usize) {
    let dir = std::env::temp_dir().join(format!("timeline_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let store = Arc::new(JournaledStore::open(&dir.join("timeline.journal")).unwrap());
    let handler = Arc::new(TriggerHandler::new(store.clone(), Arc::new(NotifyHub::new())));

    let start = Instant::now();
    let mut handles = Vec::new();
    for t in 0..n_tasks {
        let store = store.clone();
        let handler = handler.clone();
        handles.push(tokio::spawn(async move {
            let project = format!("tenant-{t}");
            let mut latencies = Vec::with_capacity(n_per_task);
            for i in 0..n_per_task {
                let it = item(format!("i{i}"), i as i64 * HOUR, vec![], vec![format!("r{}", i % 10)]);
                latencies.push(write(store.as_ref(), &handler, &project, it).await);
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in handles {
        all.extend(h.await.unwrap());
    }
    let elapsed = start.elapsed();
    let ops = all.len() as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} writes in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
    print_latency("journaled write+validate latency", &mut all);

    let t = Instant::now();
    let written = handler.revalidate_all().await.unwrap();
    println!("  full sweep: {written} patches in {:.2}ms", t.elapsed().as_secs_f64() * 1000.0);

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::main]
async fn main() {
    println!("=== timeline-validator stress benchmark ===\n");

    println!("[phase 1] dependency chain");
    phase1_chain(2000).await;

    println!("\n[phase 2] resource hotspot");
    phase2_hotspot(20, 50).await;

    println!("\n[phase 3] concurrent journaled writes");
    phase3_concurrent_journaled(10, 200).await;

    println!("\n=== benchmark complete ===");
}
