//! Benchmarks for device listing parsers and volume placement
//!
//! Target: placement over 1K nodes well under the jitter floor

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use local_storage_operator::config::{ConfigHandle, DiskConfig};
use local_storage_operator::crd::{ActivityState, Partition, RawDevice};
use local_storage_operator::hardware::allocation::{
    JitterConfig, PlacementCandidate, PlacementEngine, SchedulerStrategy, VolumeScheduler,
};
use local_storage_operator::hardware::discovery::{parse_disk_string, parse_partition_string};
use local_storage_operator::hardware::registry::NodeRegistry;
use local_storage_operator::NodeInfo;

fn lsblk_output(disks: usize) -> String {
    (0..disks)
        .map(|i| {
            format!(
                "NAME=\"/dev/sd{}\" FSTYPE=\"\" MOUNTPOINT=\"\" SIZE=\"{}\" STATE=\"running\" TYPE=\"disk\" ROTA=\"1\" RO=\"0\" PKNAME=\"\"\n",
                i,
                (i as u64 + 1) << 30
            )
        })
        .collect()
}

fn parted_output(partitions: usize) -> String {
    let mut out = String::from(
        "Model: ATA QEMU HARDDISK (scsi)\nDisk /dev/sdb: 107374182400B\nPartition Table: gpt\n\n\
         Number  Start     End       Size      File system  Name      Flags\n",
    );
    for i in 0..partitions {
        out.push_str(&format!(
            " {:<6} {:<9} {:<9} {:<9} {:<12} {:<9}\n",
            i + 1,
            format!("{}B", i * 1000 + 1),
            format!("{}B", i * 1000 + 1000),
            "1000B",
            "",
            format!("p{}", i)
        ));
    }
    out
}

fn bench_parsers(c: &mut Criterion) {
    let mut group = c.benchmark_group("parser");

    for disks in [16usize, 256] {
        let output = lsblk_output(disks);
        group.throughput(Throughput::Elements(disks as u64));
        group.bench_with_input(BenchmarkId::new("lsblk", disks), &output, |b, output| {
            b.iter(|| parse_disk_string(black_box(output)));
        });
    }

    let output = parted_output(64);
    group.throughput(Throughput::Elements(64));
    group.bench_function("parted_print", |b| {
        b.iter(|| parse_partition_string(black_box(&output)));
    });

    group.finish();
}

fn raw_device(i: u64) -> RawDevice {
    let partitions = if i % 2 == 0 { 3 } else { 0 };
    RawDevice {
        name: format!("/dev/sd{}", i),
        capacity: ((i + 1) << 30).to_string(),
        available: ((i + 1) << 29).to_string(),
        partition: vec![Partition::default(); partitions],
        free_space: vec![Partition {
            size: format!("{}B", (i + 1) << 28),
            ..Default::default()
        }],
        activity: ActivityState::Active,
        ..Default::default()
    }
}

fn bench_placement(c: &mut Criterion) {
    let mut group = c.benchmark_group("placement");

    let candidates: Vec<PlacementCandidate> = (0..1000u64)
        .map(|i| PlacementCandidate::new(format!("node-{:04}", i), "lsd-ssd", (i * 7919) % 100_000))
        .collect();
    group.throughput(Throughput::Elements(candidates.len() as u64));
    group.bench_function("choose_1k", |b| {
        b.iter(|| PlacementEngine::choose(black_box(candidates.clone()), SchedulerStrategy::Binpack));
    });

    let devices: Vec<RawDevice> = (0..64).map(raw_device).collect();
    group.throughput(Throughput::Elements(devices.len() as u64));
    group.bench_function("partition_or_raw_64", |b| {
        b.iter(|| {
            PlacementEngine::select_partition_or_raw(
                black_box(&devices),
                1 << 28,
                false,
                SchedulerStrategy::Spreadout,
            )
        });
    });

    group.finish();
}

fn bench_select_volume_node(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler");
    let runtime = tokio::runtime::Runtime::new().unwrap();

    let registry = NodeRegistry::new();
    for i in 0..1000u64 {
        registry.upsert_node(NodeInfo {
            name: format!("node-{:04}", i),
            allocatable: [("storage.local.io/lsd-ssd".to_string(), (i + 1) << 30)].into(),
            ready: true,
            ..Default::default()
        });
    }
    let scheduler = VolumeScheduler::new(registry, ConfigHandle::new(DiskConfig::default()))
        .with_jitter(JitterConfig::disabled());

    group.throughput(Throughput::Elements(1000));
    group.bench_function("select_volume_node_1k", |b| {
        b.iter(|| runtime.block_on(scheduler.select_volume_node(black_box(10 << 30), "lsd-ssd", None)));
    });

    group.finish();
}

criterion_group!(benches, bench_parsers, bench_placement, bench_select_volume_node);
criterion_main!(benches);
