use anyhow::{anyhow, bail, Context, Result};
use byteorder::{BigEndian, ReadBytesExt};
use flate2::read::GzDecoder;
use log::{info, warn};
use ndarray::{s, Array1, Array2, Axis};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use tokio::fs;

pub const IMAGE_SIDE: usize = 28;
pub const IMAGE_DIM: usize = IMAGE_SIDE * IMAGE_SIDE;
pub const LABELS: usize = 10;

/// Per-pixel statistics of the MNIST training set, applied after scaling to [0, 1].
pub const MNIST_MEAN: f32 = 0.1307;
pub const MNIST_STD: f32 = 0.3081;

const IMAGES_MAGIC: u32 = 2051;
const LABELS_MAGIC: u32 = 2049;

const BASE_URLS: [&str; 2] = [
    "https://storage.googleapis.com/cvdf-datasets/mnist",
    "http://yann.lecun.com/exdb/mnist",
];
const TRAIN_IMAGES: &str = "train-images-idx3-ubyte.gz";
const TRAIN_LABELS: &str = "train-labels-idx1-ubyte.gz";
const TEST_IMAGES: &str = "t10k-images-idx3-ubyte.gz";
const TEST_LABELS: &str = "t10k-labels-idx1-ubyte.gz";

/// Labeled images, one flattened image per row.
///
/// `indices` holds each row's position in the dataset it was originally cut
/// from, so shards can be checked against their source.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub images: Array2<f32>,
    pub labels: Array1<usize>,
    pub indices: Vec<usize>,
}

/// A slice of a dataset fed through the model in one step.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub images: Array2<f32>,
    pub labels: Array1<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl Dataset {
    pub fn new(images: Array2<f32>, labels: Array1<usize>) -> Result<Self> {
        if images.nrows() != labels.len() {
            bail!(
                "image/label count mismatch: {} images, {} labels",
                images.nrows(),
                labels.len()
            );
        }
        if images.ncols() != IMAGE_DIM {
            bail!("expected {} pixels per image, got {}", IMAGE_DIM, images.ncols());
        }
        if let Some(bad) = labels.iter().find(|&&l| l >= LABELS) {
            bail!("label {} out of range", bad);
        }
        let indices = (0..labels.len()).collect();
        Ok(Self { images, labels, indices })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Contiguous rows `start..end`.
    pub fn slice(&self, start: usize, end: usize) -> Dataset {
        Dataset {
            images: self.images.slice(s![start..end, ..]).to_owned(),
            labels: self.labels.slice(s![start..end]).to_owned(),
            indices: self.indices[start..end].to_vec(),
        }
    }

    pub fn batch(&self, positions: &[usize]) -> Batch {
        Batch {
            images: self.images.select(Axis(0), positions),
            labels: self.labels.select(Axis(0), positions),
        }
    }

    /// Sequential, unshuffled batches; the last one may be short.
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = Batch> + '_ {
        let n = self.len();
        (0..n).step_by(batch_size.max(1)).map(move |start| {
            let end = (start + batch_size).min(n);
            Batch {
                images: self.images.slice(s![start..end, ..]).to_owned(),
                labels: self.labels.slice(s![start..end]).to_owned(),
            }
        })
    }

    /// Standardise pixels with the MNIST mean and std.
    pub fn normalize(mut self) -> Self {
        self.images.mapv_inplace(|v| (v - MNIST_MEAN) / MNIST_STD);
        self
    }
}

pub struct MnistData {
    pub train: Dataset,
    pub test: Dataset,
}

impl MnistData {
    /// Load MNIST from `data_dir`, downloading any archive that is missing or corrupt.
    pub async fn load(data_dir: impl AsRef<Path>) -> Result<Self> {
        Self::load_from(data_dir, &BASE_URLS).await
    }

    pub(crate) async fn load_from(data_dir: impl AsRef<Path>, mirrors: &[&str]) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("creating {}", data_dir.display()))?;

        let (train_images_raw, train_labels_raw, test_images_raw, test_labels_raw) = tokio::try_join!(
            fetch_and_inflate(mirrors, TRAIN_IMAGES, data_dir.join(TRAIN_IMAGES)),
            fetch_and_inflate(mirrors, TRAIN_LABELS, data_dir.join(TRAIN_LABELS)),
            fetch_and_inflate(mirrors, TEST_IMAGES, data_dir.join(TEST_IMAGES)),
            fetch_and_inflate(mirrors, TEST_LABELS, data_dir.join(TEST_LABELS)),
        )?;

        let train = Dataset::new(
            parse_images(&train_images_raw).context("parsing training images")?,
            parse_labels(&train_labels_raw).context("parsing training labels")?,
        )?
        .normalize();
        let test = Dataset::new(
            parse_images(&test_images_raw).context("parsing test images")?,
            parse_labels(&test_labels_raw).context("parsing test labels")?,
        )?
        .normalize();

        info!("Loaded MNIST dataset:");
        info!("  Train images: {:?}", train.images.shape());
        info!("  Train labels: {:?}", train.labels.shape());
        info!("  Test images: {:?}", test.images.shape());
        info!("  Test labels: {:?}", test.labels.shape());

        Ok(Self { train, test })
    }
}

async fn download(url: &str, path: &PathBuf) -> Result<()> {
    info!("Downloading {}", url);
    let bytes = reqwest::get(url).await?.error_for_status()?.bytes().await?;
    fs::write(path, &bytes).await?;
    Ok(())
}

async fn inflate(path: &PathBuf) -> Result<Vec<u8>> {
    let bytes = fs::read(path).await?;
    gunzip(&bytes)
}

pub(crate) fn gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    // gzip magic 1F 8B
    if bytes.len() < 2 || bytes[0] != 0x1f || bytes[1] != 0x8b {
        return Err(anyhow!("Invalid gzip header"));
    }
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Use the cached archive when it inflates cleanly; otherwise drop it and
/// fetch a fresh copy, one retry per mirror before moving on.
async fn fetch_and_inflate(urls: &[&str], filename: &str, path: PathBuf) -> Result<Vec<u8>> {
    if path.exists() {
        match inflate(&path).await {
            Ok(data) => return Ok(data),
            Err(e) => {
                warn!("Corrupt cached archive {}: {}", path.display(), e);
                let _ = fs::remove_file(&path).await;
            }
        }
    }

    for &base in urls {
        let url = format!("{}/{}", base, filename);
        for attempt in 0..2 {
            if let Err(e) = download(&url, &path).await {
                warn!("Download of {} failed: {}", url, e);
                break;
            }
            match inflate(&path).await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    warn!("Corrupt archive {} (attempt {}): {}", path.display(), attempt + 1, e);
                    let _ = fs::remove_file(&path).await;
                }
            }
        }
    }

    Err(anyhow!("Failed to download or inflate {}", filename))
}

fn read_u32_be(rdr: &mut Cursor<&[u8]>) -> Result<u32> {
    Ok(rdr.read_u32::<BigEndian>()?)
}

/// Parse an IDX3 image file, scaling pixels to [0, 1].
pub fn parse_images(bytes: &[u8]) -> Result<Array2<f32>> {
    let mut rdr = Cursor::new(bytes);
    let magic = read_u32_be(&mut rdr)?;
    if magic != IMAGES_MAGIC {
        return Err(anyhow!("Invalid magic for images: {}", magic));
    }
    let num = read_u32_be(&mut rdr)? as usize;
    let rows = read_u32_be(&mut rdr)? as usize;
    let cols = read_u32_be(&mut rdr)? as usize;
    let pixels = rows
        .checked_mul(cols)
        .ok_or_else(|| anyhow!("image dimensions {}x{} overflow", rows, cols))?;
    let expected = num
        .checked_mul(pixels)
        .ok_or_else(|| anyhow!("{} images of {} pixels overflow", num, pixels))?;
    let remaining = bytes.len() - rdr.position() as usize;
    if expected > remaining {
        bail!("image payload needs {} bytes, only {} present", expected, remaining);
    }
    let mut data = vec![0u8; expected];
    rdr.read_exact(&mut data)?;
    let images = Array2::from_shape_vec(
        (num, pixels),
        data.into_iter().map(|v| v as f32 / 255.0).collect(),
    )?;
    Ok(images)
}

/// Parse an IDX1 label file.
pub fn parse_labels(bytes: &[u8]) -> Result<Array1<usize>> {
    let mut rdr = Cursor::new(bytes);
    let magic = read_u32_be(&mut rdr)?;
    if magic != LABELS_MAGIC {
        return Err(anyhow!("Invalid magic for labels: {}", magic));
    }
    let num = read_u32_be(&mut rdr)? as usize;
    let remaining = bytes.len() - rdr.position() as usize;
    if num > remaining {
        bail!("label payload needs {} bytes, only {} present", num, remaining);
    }
    let mut data = vec![0u8; num];
    rdr.read_exact(&mut data)?;
    Ok(Array1::from_iter(data.into_iter().map(|v| v as usize)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn idx_images(num: u32, pixel: u8) -> Vec<u8> {
        let mut bytes = Vec::new();
        for v in [IMAGES_MAGIC, num, IMAGE_SIDE as u32, IMAGE_SIDE as u32] {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        bytes.extend(std::iter::repeat(pixel).take(num as usize * IMAGE_DIM));
        bytes
    }

    fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&LABELS_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&(labels.len() as u32).to_be_bytes());
        bytes.extend_from_slice(labels);
        bytes
    }

    #[test]
    fn test_parse_images_scales_pixels() {
        let images = parse_images(&idx_images(3, 255)).unwrap();
        assert_eq!(images.shape(), &[3, IMAGE_DIM]);
        assert!(images.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_parse_rejects_bad_magic_and_truncation() {
        let mut bytes = idx_images(1, 0);
        bytes[3] = 0;
        assert!(parse_images(&bytes).is_err());

        let bytes = idx_images(2, 0);
        assert!(parse_images(&bytes[..bytes.len() - 1]).is_err());

        assert!(parse_labels(&idx_images(1, 0)).is_err());
    }

    #[test]
    fn test_parse_labels() {
        let labels = parse_labels(&idx_labels(&[7, 2, 1])).unwrap();
        assert_eq!(labels.to_vec(), vec![7, 2, 1]);
    }

    #[test]
    fn test_gunzip_roundtrip_and_header_check() {
        let raw = idx_labels(&[0, 9]);
        assert_eq!(gunzip(&gzip(&raw)).unwrap(), raw);
        assert!(gunzip(&raw).is_err());
    }

    #[test]
    fn test_dataset_rejects_out_of_range_label() {
        let images = Array2::zeros((1, IMAGE_DIM));
        assert!(Dataset::new(images, Array1::from_vec(vec![10])).is_err());
    }

    #[test]
    fn test_normalize_and_batches() {
        let images = Array2::zeros((5, IMAGE_DIM));
        let ds = Dataset::new(images, Array1::from_vec(vec![0, 1, 2, 3, 4]))
            .unwrap()
            .normalize();
        assert!((ds.images[[0, 0]] + MNIST_MEAN / MNIST_STD).abs() < 1e-6);

        let sizes: Vec<usize> = ds.batches(2).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_slice_keeps_original_indices() {
        let images = Array2::zeros((4, IMAGE_DIM));
        let ds = Dataset::new(images, Array1::from_vec(vec![0, 1, 2, 3])).unwrap();
        let tail = ds.slice(2, 4).slice(1, 2);
        assert_eq!(tail.indices, vec![3]);
        assert_eq!(tail.labels.to_vec(), vec![3]);
    }

    #[test]
    fn test_parse_rejects_oversized_headers() {
        let mut bytes = Vec::new();
        for v in [IMAGES_MAGIC, u32::MAX, u32::MAX, u32::MAX] {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        assert!(parse_images(&bytes).is_err());

        let mut bytes = idx_images(1, 0);
        bytes[4..8].copy_from_slice(&1_000_000u32.to_be_bytes());
        let err = parse_images(&bytes).unwrap_err();
        assert!(err.to_string().contains("only"));

        let mut bytes = idx_labels(&[1, 2]);
        bytes[4..8].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(parse_labels(&bytes).is_err());
    }

    fn gzip(raw: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(raw).unwrap();
        enc.finish().unwrap()
    }

    fn write_cache(dir: &Path, train: &[u8], test: &[u8]) {
        std::fs::write(dir.join(TRAIN_IMAGES), gzip(&idx_images(train.len() as u32, 255))).unwrap();
        std::fs::write(dir.join(TRAIN_LABELS), gzip(&idx_labels(train))).unwrap();
        std::fs::write(dir.join(TEST_IMAGES), gzip(&idx_images(test.len() as u32, 0))).unwrap();
        std::fs::write(dir.join(TEST_LABELS), gzip(&idx_labels(test))).unwrap();
    }

    #[tokio::test]
    async fn test_load_uses_cached_archives() {
        let dir = tempfile::tempdir().unwrap();
        write_cache(dir.path(), &[3, 1, 4], &[1, 5]);

        let data = MnistData::load_from(dir.path(), &[]).await.unwrap();
        assert_eq!(data.train.images.shape(), &[3, IMAGE_DIM]);
        assert_eq!(data.test.images.shape(), &[2, IMAGE_DIM]);
        assert_eq!(data.train.labels.to_vec(), vec![3, 1, 4]);
        assert!((data.train.images[[0, 0]] - (1.0 - MNIST_MEAN) / MNIST_STD).abs() < 1e-5);
        assert!((data.test.images[[1, 0]] + MNIST_MEAN / MNIST_STD).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_load_drops_corrupt_cached_archive() {
        let dir = tempfile::tempdir().unwrap();
        write_cache(dir.path(), &[0], &[0]);
        let corrupt = dir.path().join(TEST_LABELS);
        std::fs::write(&corrupt, b"not gzip").unwrap();

        assert!(MnistData::load_from(dir.path(), &[]).await.is_err());
        assert!(!corrupt.exists());
        assert!(dir.path().join(TRAIN_IMAGES).exists());
    }
}
