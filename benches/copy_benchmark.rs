use std::hint::black_box;
use std::io::{self, Cursor};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ntfs_rawcopy::{
    api::ROOT_RECORD,
    copier::copy_stream,
    paged_reader::PagedReader,
    test_utils::{Fragment, ImageBuilder, StreamData},
    volume::VolumeContext,
};

const CACHE_PAGES: usize = 64;
const DIRECTORY_FILES: usize = 120;

fn fragmented_image() -> (Vec<u8>, u64) {
    let mut builder = ImageBuilder::new();
    let mut fragments = Vec::new();
    for i in 0..16u8 {
        fragments.push(Fragment::Data(vec![i; 256 * 1024]));
        if i % 4 == 3 {
            fragments.push(Fragment::Sparse(16));
        }
    }
    let data = StreamData::non_resident(fragments);
    let size = data.size();
    builder.add_file(ROOT_RECORD, "hiberfil.sys", data);
    (builder.build(), size)
}

fn bench_copy_stream(c: &mut Criterion) {
    let (image, size) = fragmented_image();
    let mut group = c.benchmark_group("copy_stream");
    group.throughput(Throughput::Bytes(size));

    for page_size in [4096u64, 64 * 1024, 1024 * 1024] {
        group.bench_with_input(
            BenchmarkId::from_parameter(page_size),
            &page_size,
            |b, &page_size| {
                let reader = PagedReader::new(Cursor::new(image.clone()), page_size, CACHE_PAGES)
                    .expect("paged reader");
                let mut ctx = VolumeContext::new(reader, 0).expect("volume");
                let root = ctx.root_directory().expect("root");
                let record = ctx.open(&root, "hiberfil.sys").expect("file");

                b.iter(|| {
                    let mut stream = ctx.open_stream(&record, None).expect("stream");
                    let written = copy_stream(&mut stream, &mut io::sink()).expect("copy");
                    black_box(written)
                });
            },
        );
    }
    group.finish();
}

fn bench_directory_lookup(c: &mut Criterion) {
    let mut builder = ImageBuilder::new();
    let dir = builder.add_directory(ROOT_RECORD, "System32");
    for i in 0..DIRECTORY_FILES {
        builder.add_file(
            dir,
            &format!("library-{i:03}.dll"),
            StreamData::Resident(vec![0; 16]),
        );
    }
    let reader = PagedReader::new(Cursor::new(builder.build()), 4096, CACHE_PAGES)
        .expect("paged reader");
    let mut ctx = VolumeContext::new(reader, 0).expect("volume");
    let root = ctx.root_directory().expect("root");
    let target = format!("system32/LIBRARY-{:03}.DLL", DIRECTORY_FILES - 1);

    c.bench_function("directory_lookup", |b| {
        b.iter(|| {
            let record = ctx.open(&root, black_box(&target)).expect("lookup");
            black_box(record.number)
        })
    });
}

criterion_group!(benches, bench_copy_stream, bench_directory_lookup);
criterion_main!(benches);
