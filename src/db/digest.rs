//! TDigest serialization for window percentile state.
//!
//! Sealed windows persist their digest as a compact varint blob:
//! `[centroid_count] [mean_bits, weight_bits]...` with each f64 stored as
//! its bit pattern encoded as a varint u64.

use tdigests::{Centroid, TDigest};
use unsigned_varint::{decode as varint_decode, encode as varint_encode};

/// Centroid budget for stored digests.
const COMPRESSION: usize = 100;

/// Serialize a digest for storage.
pub fn serialize_digest(digest: &TDigest) -> Vec<u8> {
    let centroids = digest.centroids();
    let mut data = Vec::with_capacity(centroids.len() * 16 + 4);

    let mut buf = varint_encode::u64_buffer();
    data.extend_from_slice(varint_encode::u64(centroids.len() as u64, &mut buf));

    for c in centroids {
        data.extend_from_slice(varint_encode::u64(c.mean.to_bits(), &mut buf));
        data.extend_from_slice(varint_encode::u64(c.weight.to_bits(), &mut buf));
    }

    data
}

/// Deserialize a stored digest. Empty or truncated blobs yield `None`.
pub fn deserialize_digest(data: &[u8]) -> Option<TDigest> {
    if data.is_empty() {
        return None;
    }

    let (count, mut remaining) = varint_decode::u64(data).ok()?;
    if count == 0 {
        return None;
    }

    let mut centroids = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (mean_bits, rest) = varint_decode::u64(remaining).ok()?;
        let (weight_bits, rest) = varint_decode::u64(rest).ok()?;
        remaining = rest;
        centroids.push(Centroid::new(
            f64::from_bits(mean_bits),
            f64::from_bits(weight_bits),
        ));
    }

    Some(TDigest::from_centroids(centroids))
}

/// Build a compressed digest from raw samples.
pub fn digest_from_values(values: &[f64]) -> Option<TDigest> {
    if values.is_empty() {
        return None;
    }
    let mut digest = TDigest::from_values(values.to_vec());
    digest.compress(COMPRESSION);
    Some(digest)
}

/// Merge several stored digests into one (used for hourly-to-daily folds).
pub fn merge_digests<'a, I>(blobs: I) -> Option<TDigest>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut centroids: Vec<Centroid> = Vec::new();
    for blob in blobs {
        if let Some(digest) = deserialize_digest(blob) {
            centroids.extend(digest.centroids().iter().map(|c| Centroid::new(c.mean, c.weight)));
        }
    }
    if centroids.is_empty() {
        return None;
    }
    centroids.sort_by(|a, b| a.mean.total_cmp(&b.mean));
    let mut merged = TDigest::from_centroids(centroids);
    merged.compress(COMPRESSION);
    Some(merged)
}

/// Quantile estimate straight from a stored blob.
pub fn quantile(data: &[u8], q: f64) -> Option<f64> {
    deserialize_digest(data).map(|d| d.estimate_quantile(q))
}
