use std::path::{Path, PathBuf};

use anyhow::Result;
use batchinfer_core::config::{ColorMode, ImageSpec, Partitioning};
use batchinfer_core::types::Image;
use batchinfer_loader::{Dataset, Location, ObjectStore};

fn temp_dir(test_name: &str) -> Result<PathBuf> {
    let mut root = std::env::temp_dir();
    root.push(format!(
        "batchinfer-loader-{test_name}-{}-{}",
        std::process::id(),
        batchinfer_observe::time::unix_time_ms()
    ));
    std::fs::create_dir_all(&root)?;
    Ok(root)
}

fn write_png(path: &Path, w: u32, h: u32, rgb: [u8; 3]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    image::RgbImage::from_pixel(w, h, image::Rgb(rgb)).save(path)?;
    Ok(())
}

fn seed_tree(root: &Path) -> Result<()> {
    for i in 0..3 {
        write_png(&root.join(format!("cat/{i}.png")), 12, 9, [200, 10, 10])?;
    }
    for i in 0..4 {
        write_png(&root.join(format!("dog/{i}.png")), 7, 15, [10, 10, 200])?;
    }
    std::fs::write(root.join("dog/README.txt"), b"not an image")?;
    Ok(())
}

fn spec() -> ImageSpec {
    ImageSpec {
        height: 8,
        width: 8,
        mode: ColorMode::Rgb,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lists_labels_and_decodes_in_order() -> Result<()> {
    let root = temp_dir("lists_labels")?;
    seed_tree(&root)?;

    let ds = Dataset::discover(
        &Location::Local(root.clone()),
        &Partitioning::default(),
        spec(),
        ObjectStore::local(),
    )
    .await?
    .with_decode_threads(2)?;
    assert_eq!(ds.len(), 7);
    assert_eq!(ds.labels(), vec!["cat", "dog"]);

    let (mut rx, task) = ds.spawn_batch_stream(3, 2, 1);
    let mut ids = Vec::new();
    let mut sizes = Vec::new();
    while let Some(batch) = rx.recv().await {
        sizes.push(batch.len());
        for r in batch {
            assert!(matches!(&r.image, Image::Raw(a) if a.dim() == (8, 8, 3)));
            let expected = if r.sample_id < 3 { "cat" } else { "dog" };
            assert_eq!(r.class, expected);
            ids.push(r.sample_id);
        }
    }
    task.await??;

    assert_eq!(sizes, vec![3, 3, 1]);
    assert_eq!(ids, (0..7).collect::<Vec<u64>>());
    let metrics = ds.metrics();
    assert_eq!(metrics.decoded_records_total.get(), 7);
    assert_eq!(metrics.loaded_batches_total.get(), 3);
    assert!(metrics.fetched_bytes_total.get() > 0);

    std::fs::remove_dir_all(&root)?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn base_dir_selects_subtree() -> Result<()> {
    let root = temp_dir("base_dir")?;
    seed_tree(&root.join("train"))?;
    write_png(&root.join("val/cat/0.png"), 4, 4, [1, 2, 3])?;

    let partitioning = Partitioning {
        base_dir: "train".into(),
        field: "class".into(),
    };
    let ds = Dataset::discover(
        &Location::Local(root.clone()),
        &partitioning,
        spec(),
        ObjectStore::local(),
    )
    .await?;
    assert_eq!(ds.len(), 7);
    assert_eq!(ds.labels(), vec!["cat", "dog"]);
    assert!(ds.entries().iter().all(|e| e.rel.starts_with("train/")));

    let val = Dataset::discover(
        &Location::Local(root.clone()),
        &Partitioning {
            base_dir: "val".into(),
            field: "class".into(),
        },
        spec(),
        ObjectStore::local(),
    )
    .await?;
    assert_eq!(val.len(), 1);

    std::fs::remove_dir_all(&root)?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nested_label_directories_are_fatal() -> Result<()> {
    let root = temp_dir("nested")?;
    write_png(&root.join("animals/cat/0.png"), 4, 4, [9, 9, 9])?;
    let err = Dataset::discover(
        &Location::Local(root.clone()),
        &Partitioning::default(),
        spec(),
        ObjectStore::local(),
    )
    .await
    .unwrap_err();
    assert!(format!("{err:#}").contains("directory levels"), "{err:#}");

    std::fs::remove_dir_all(&root)?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn loose_files_and_empty_trees_are_fatal() -> Result<()> {
    let root = temp_dir("loose_files")?;
    let empty = Dataset::discover(
        &Location::Local(root.clone()),
        &Partitioning::default(),
        spec(),
        ObjectStore::local(),
    )
    .await
    .unwrap_err();
    assert!(format!("{empty:#}").contains("no images found"));

    write_png(&root.join("loose.png"), 4, 4, [0, 0, 0])?;
    let loose = Dataset::discover(
        &Location::Local(root.clone()),
        &Partitioning::default(),
        spec(),
        ObjectStore::local(),
    )
    .await
    .unwrap_err();
    assert!(format!("{loose:#}").contains("no directory"));

    std::fs::remove_dir_all(&root)?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn corrupt_image_fails_the_stream() -> Result<()> {
    let root = temp_dir("corrupt")?;
    seed_tree(&root)?;
    std::fs::write(root.join("dog/9.png"), b"\x89PNG truncated")?;

    let ds = Dataset::discover(
        &Location::Local(root.clone()),
        &Partitioning::default(),
        spec(),
        ObjectStore::local(),
    )
    .await?;
    let (mut rx, task) = ds.spawn_batch_stream(4, 2, 2);
    while rx.recv().await.is_some() {}
    let err = task.await?.unwrap_err();
    assert!(format!("{err:#}").contains("decode failed"), "{err:#}");

    std::fs::remove_dir_all(&root)?;
    Ok(())
}
