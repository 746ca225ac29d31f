use std::ops::AddAssign;
use std::time::Instant;

use gridnd::config::{read_config, Config};
use gridnd::{in_rank_order, Communicator, DomainError, Float, GridNd, Smoothing, ThreadComm};
use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

/// Payload painted per pixel: particle count and mass.
const N_FIELDS: usize = 2;

/// All particles of the snapshot, in pixel coordinates.
struct Snapshot {
    position: Array2<Float>,
    smoothing: Array1<Float>,
    data: Array2<Float>,
}

impl Snapshot {
    fn len(&self) -> usize {
        self.smoothing.len()
    }

    fn rows(
        &self,
        start: usize,
        end: usize,
    ) -> (ArrayView2<Float>, ArrayView1<Float>, ArrayView2<Float>) {
        (
            self.position.slice(s![start..end, ..]),
            self.smoothing.slice(s![start..end]),
            self.data.slice(s![start..end, ..]),
        )
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(feature = "dhat-heap")]
    let _profiler = dhat::Profiler::new_heap();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gridnd=info,gridpaint=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = read_config()?;
    tracing::info!(?config, "loaded configuration");
    if config.chunk_size == 0 || config.n_threads == 0 {
        return Err(DomainError::Configuration(
            "chunk_size and n_threads must be positive".into(),
        )
        .into());
    }
    let edges = config.grid_edges()?;
    let snapshot = generate_particles(&config);

    let start = Instant::now();
    let communicators =
        ThreadComm::create_communicators_with(config.n_threads, config.comm_options());
    let totals = ThreadComm::spawn_ranks(communicators, |comm| {
        paint_rank(comm, &config, edges.clone(), &snapshot)
    })
    .into_iter()
    .collect::<Result<Vec<_>, _>>()?;

    let runtime = start.elapsed();
    tracing::info!(?runtime, painted = totals[0], "done");

    if totals[0] != snapshot.len() as Float {
        return Err(format!(
            "painted {} particles, expected {}",
            totals[0],
            snapshot.len()
        )
        .into());
    }
    Ok(())
}

/// Generate random particles inside the image, with smoothing lengths up to `config.smoothing`.
fn generate_particles(config: &Config) -> Snapshot {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let n = config.n_particles;
    let extent = [config.pixel_height as Float, config.pixel_width as Float];

    let position = Array2::from_shape_fn((n, 2), |(_, d)| rng.gen_range(0.0..extent[d]));
    let smoothing = Array1::from_shape_fn(n, |_| rng.gen_range(0.0..=config.smoothing));
    let data = Array2::from_shape_fn((n, N_FIELDS), |(_, field)| match field {
        0 => 1.,
        _ => rng.gen_range(0.5..1.5),
    });
    Snapshot {
        position,
        smoothing,
        data,
    }
}

/// Paint every chunk of the snapshot on this rank's tile. Returns the particle count painted by
/// the whole group.
fn paint_rank(
    comm: &ThreadComm,
    config: &Config,
    edges: Vec<Vec<Float>>,
    snapshot: &Snapshot,
) -> gridnd::Result<Float> {
    let grid = GridNd::for_comm(edges, config.periodic, comm)?;
    if grid.ndim() != 2 {
        return Err(DomainError::Configuration(format!(
            "painting needs a 2D grid, got {} dimensions",
            grid.ndim()
        )));
    }
    let tile = [
        (grid.end()[0] - grid.start()[0]) as usize,
        (grid.end()[1] - grid.start()[1]) as usize,
    ];
    let mut image = Array3::<Float>::zeros((tile[0], tile[1], N_FIELDS));

    let n_total = snapshot.len();
    let full_chunk = comm.size * config.chunk_size;
    let mut received = 0;
    for chunk_start in (0..n_total).step_by(full_chunk) {
        let chunk_len = (n_total - chunk_start).min(full_chunk);
        let start = chunk_start + comm.rank * chunk_len / comm.size;
        let end = chunk_start + (comm.rank + 1) * chunk_len / comm.size;

        let (pos, sml, data) = snapshot.rows(start, end);
        received += process_chunk(comm, &grid, &mut image, pos, sml, data)?;

        if comm.rank == 0 {
            tracing::info!(chunk_start, n_total, "chunk done");
        }
    }

    let painted = image.slice(s![.., .., 0]).sum();
    in_rank_order(comm, || {
        tracing::info!(
            rank = comm.rank,
            start = ?grid.start(),
            end = ?grid.end(),
            received,
            painted,
            mass = image.slice(s![.., .., 1]).sum(),
            "tile"
        );
    })?;

    let mut total = 0.;
    for (from, bytes) in comm.all_gather(&painted.to_le_bytes())?.into_iter().enumerate() {
        let bytes: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| DomainError::TransferMismatch {
                from,
                expected: 8,
                got: bytes.len(),
            })?;
        total += Float::from_le_bytes(bytes);
    }
    Ok(total)
}

/// Move the particles of one chunk to the tiles they touch and paint them. Collective.
///
/// Returns the number of particles received, ghosts included.
fn process_chunk(
    comm: &ThreadComm,
    grid: &GridNd,
    image: &mut Array3<Float>,
    pos: ArrayView2<Float>,
    sml: ArrayView1<Float>,
    data: ArrayView2<Float>,
) -> gridnd::Result<usize> {
    let layout = grid.decompose(comm, pos, Smoothing::PerParticle(sml))?;

    let mut pos = layout.exchange(&pos)?;
    // The smoothing length goes along for a kernel painter; nearest grid point ignores it.
    let sml = layout.exchange(&sml)?;
    let data = layout.exchange(&data)?;

    // To rank device coordinates.
    for (d, &offset) in grid.start().iter().enumerate() {
        pos.column_mut(d).mapv_inplace(|x| x - offset);
    }

    paint(image, pos.view(), data.view());
    Ok(sml.len())
}

/// Add the data of each particle to its pixel according to nearest grid point algorithm.
///
/// Particles outside the tile are ghosts owned by a neighbour and are skipped.
fn paint(image: &mut Array3<Float>, pos: ArrayView2<Float>, data: ArrayView2<Float>) {
    let (nx, ny, _) = image.dim();
    for (p, values) in pos.rows().into_iter().zip(data.rows()) {
        let (x, y) = (p[0].floor(), p[1].floor());
        if x < 0. || y < 0. || x >= nx as Float || y >= ny as Float {
            continue;
        }
        image
            .slice_mut(s![x as usize, y as usize, ..])
            .add_assign(&values);
    }
}

#[cfg(test)]
mod test {
    use gridnd::thread_comm::CommOptions;
    use ndarray::array;

    use super::*;

    #[test]
    fn test_paint_skips_ghosts() {
        let mut image = Array3::<Float>::zeros((2, 2, N_FIELDS));
        let pos = array![[0.5, 0.5], [1.9, 0.1], [-0.2, 0.5], [2.0, 1.0], [0.1, 0.2]];
        let data = array![[1., 2.], [1., 3.], [1., 4.], [1., 5.], [1., 6.]];
        paint(&mut image, pos.view(), data.view());
        assert_eq!(array![[2., 0.], [1., 0.]], image.slice(s![.., .., 0]));
        assert_eq!(array![[8., 0.], [3., 0.]], image.slice(s![.., .., 1]));
    }

    fn painted_totals(periodic: bool) -> Vec<Float> {
        let config = Config {
            n_particles: 2000,
            n_threads: 4,
            seed: 5,
            chunk_size: 128,
            pixel_height: 40,
            pixel_width: 60,
            tile_padding: 8,
            smoothing: 3.,
            periodic,
            edges: None,
            timeout_ms: Some(10_000),
            max_transfer_items: None,
        };
        let edges = config.grid_edges().unwrap();
        let snapshot = generate_particles(&config);
        let communicators = ThreadComm::create_communicators_with(
            config.n_threads,
            CommOptions {
                max_transfer_items: 64,
                ..config.comm_options()
            },
        );
        ThreadComm::spawn_ranks(communicators, |comm| {
            paint_rank(comm, &config, edges.clone(), &snapshot).unwrap()
        })
    }

    #[test]
    fn test_every_particle_painted_once() {
        assert_eq!(vec![2000.; 4], painted_totals(false));
    }

    #[test]
    fn test_periodic_ghosts_are_not_painted_twice() {
        assert_eq!(vec![2000.; 4], painted_totals(true));
    }
}
