//! K-means over node embeddings with k-means++ seeding

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Assign each point a cluster label in `0..k`.
///
/// `k` is clamped to the number of points; an empty input yields no labels.
/// Seeding is driven by `seed`, so equal inputs give equal labels.
pub fn kmeans(points: &[Vec<f32>], k: usize, max_iterations: usize, seed: u64) -> Vec<usize> {
    let n = points.len();
    if n == 0 {
        return Vec::new();
    }
    let k = k.clamp(1, n);
    if k == 1 {
        return vec![0; n];
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = seed_centroids(points, k, &mut rng);
    let mut labels = vec![usize::MAX; n];

    for iteration in 0..max_iterations.max(1) {
        let mut changed = false;
        for (i, point) in points.iter().enumerate() {
            let nearest = nearest_centroid(point, &centroids);
            if labels[i] != nearest {
                labels[i] = nearest;
                changed = true;
            }
        }
        if !changed {
            tracing::debug!(iteration, k, points = n, "k-means converged");
            break;
        }
        centroids = recompute_centroids(points, &labels, &centroids);
    }

    labels
}

/// k-means++: first centroid uniform, then proportional to squared distance
fn seed_centroids(points: &[Vec<f32>], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let mut centroids = Vec::with_capacity(k);
    centroids.push(points[rng.gen_range(0..points.len())].clone());

    while centroids.len() < k {
        let weights: Vec<f32> = points
            .iter()
            .map(|p| {
                centroids
                    .iter()
                    .map(|c| squared_distance(p, c))
                    .fold(f32::MAX, f32::min)
            })
            .collect();

        match WeightedIndex::new(&weights) {
            Ok(dist) => centroids.push(points[dist.sample(rng)].clone()),
            // Every point sits on a centroid already
            Err(_) => break,
        }
    }
    centroids
}

fn nearest_centroid(point: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best = 0;
    let mut best_distance = f32::MAX;
    for (i, centroid) in centroids.iter().enumerate() {
        let d = squared_distance(point, centroid);
        if d < best_distance {
            best_distance = d;
            best = i;
        }
    }
    best
}

fn recompute_centroids(points: &[Vec<f32>], labels: &[usize], previous: &[Vec<f32>]) -> Vec<Vec<f32>> {
    previous
        .iter()
        .enumerate()
        .map(|(cluster, old)| {
            let mut sum = vec![0.0f32; old.len()];
            let mut count = 0usize;
            for (point, _) in points.iter().zip(labels).filter(|(_, &l)| l == cluster) {
                for (s, v) in sum.iter_mut().zip(point) {
                    *s += v;
                }
                count += 1;
            }
            if count == 0 {
                // Empty cluster keeps its centroid
                return old.clone();
            }
            sum.iter_mut().for_each(|s| *s /= count as f32);
            sum
        })
        .collect()
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}
