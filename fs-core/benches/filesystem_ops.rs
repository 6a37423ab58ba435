use blockvfs::block_ranges::BlockRangeAllocator;
use blockvfs::VirtualFilesystem;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tempfile::TempDir;

fn benchmark_file_operations(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let mut fs = VirtualFilesystem::open(temp_dir.path().join("bench.vfs")).unwrap();
    fs.create_file("/bench.txt", None).unwrap();

    c.bench_function("file_write_1kb", |b| {
        let data = vec![0u8; 1024];
        b.iter(|| {
            fs.write_file("/bench.txt", black_box(&data)).unwrap();
        });
    });

    fs.write_file("/bench.txt", &[42u8; 1024]).unwrap();
    c.bench_function("file_read_1kb", |b| {
        b.iter(|| {
            black_box(fs.read_file("/bench.txt").unwrap());
        });
    });

    fs.create_directory("/deep", None).unwrap();
    fs.create_directory("/deep/er", None).unwrap();
    fs.create_file("/deep/er/leaf", None).unwrap();
    c.bench_function("resolve_3_levels", |b| {
        b.iter(|| {
            black_box(fs.resolve(black_box("/deep/er/leaf")).unwrap());
        });
    });
}

fn benchmark_allocator(c: &mut Criterion) {
    c.bench_function("allocate_release_fragmented", |b| {
        let mut allocator = BlockRangeAllocator::new(4096);
        // Leave every other block allocated so the free set is fragmented
        let all = allocator.allocate(4096).unwrap();
        let odd: Vec<u32> = all.iter().copied().filter(|i| i % 2 == 1).collect();
        allocator.release(&odd).unwrap();

        b.iter(|| {
            let blocks = allocator.allocate(black_box(16)).unwrap();
            allocator.release(&blocks).unwrap();
        });
    });
}

criterion_group!(benches, benchmark_file_operations, benchmark_allocator);
criterion_main!(benches);
