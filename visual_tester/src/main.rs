use anyhow::{Context, bail};
use clap::Parser;
use myko_vision::core_modules::codec::codec;
use myko_vision::core_modules::query::QueryIntent;
use myko_vision::{BackendChoice, EngineConfig, FastBackend, Session};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Runs propose, select and render on one still image and writes the overlay.
#[derive(Parser, Debug)]
#[command(name = "visual_tester")]
struct Args {
    /// Input image (any format the `image` crate reads).
    input: PathBuf,
    /// Output PNG with the overlay drawn on it.
    output: PathBuf,
    #[arg(long, default_value = "cells")]
    query: String,
    /// Proposal indices to select. Empty takes the top-ranked candidates, or
    /// every candidate for "all"/"every" queries.
    #[arg(long, value_delimiter = ',')]
    indices: Vec<i64>,
    #[arg(long, default_value = "auto")]
    backend: BackendChoice,
    /// Also write the field-of-view and foreground masks into this directory.
    #[arg(long)]
    dump_masks: Option<PathBuf>,
}

/// Explicit indices win. Otherwise "all"/"every" queries let the selection
/// policy take everything and plain queries take the top `auto_select_top_k`.
fn default_indices(requested: &[i64], query: &str, count: usize, top_k: usize) -> Vec<i64> {
    if !requested.is_empty() || QueryIntent::parse(query).wants_all {
        return requested.to_vec();
    }
    (0..top_k.min(count) as i64).collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    // --- 1. Load the still and put it on the wire format ---
    let image = image::open(&args.input)
        .with_context(|| format!("opening {}", args.input.display()))?
        .to_rgb8();
    let payload = codec::encode_png(&image).context("encoding input frame")?;

    // --- 2. Propose and select ---
    let session = Session::new(EngineConfig::default())?;
    let report = session.propose(&args.query, Some(&payload), args.backend).await?;
    println!("{} proposal(s) from backend '{}'", report.count, report.backend_used);
    for c in &report.candidates {
        println!(
            "  #{:<3} area {:>9.2}  circ {:.3}  score {:.3}  bbox {:?}",
            c.index, c.area, c.circularity, c.score, c.bbox
        );
    }
    if report.count == 0 {
        bail!("no objects detected for '{}'", args.query);
    }
    let indices = default_indices(&args.indices, &args.query, report.count, session.config().auto_select_top_k);
    let summary = session.select(&indices, Some(&args.query))?;
    println!("{summary}");

    // --- 3. Render and write ---
    let rendered = session.render_frame(&payload);
    let out = codec::decode(&rendered).context("decoding rendered frame")?;
    out.image
        .save(&args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;
    println!("Overlay saved to {}", args.output.display());

    // --- 4. Optional intermediate masks ---
    if let Some(dir) = args.dump_masks {
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let detection = FastBackend::new(session.config().detection.clone()).detect(&image, &QueryIntent::parse(&args.query));
        detection.fov.save(dir.join("fov.png")).context("writing fov mask")?;
        detection
            .foreground
            .mask
            .save(dir.join("foreground.png"))
            .context("writing foreground mask")?;
        println!(
            "Masks saved to {} ({} instance(s), cues {:?})",
            dir.display(),
            detection.labels.count,
            detection.foreground.cues
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn explicit_indices_are_kept() {
        assert_eq!(default_indices(&[2, 0], "cells", 5, 1), vec![2, 0]);
    }

    #[test]
    fn plain_query_takes_the_top_candidates() {
        assert_eq!(default_indices(&[], "cells", 5, 3), vec![0, 1, 2]);
        assert_eq!(default_indices(&[], "cells", 2, 3), vec![0, 1]);
        assert!(default_indices(&[], "all cells", 5, 3).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn default_run_selects_without_indices() {
        let config = EngineConfig {
            fast_timeout_ms: 120_000,
            worker_threads: 2,
            ..EngineConfig::default()
        };
        let session = Session::new(config).unwrap();
        let image = RgbImage::from_fn(1000, 1000, |x, y| {
            if (50..150).contains(&x) && (50..150).contains(&y) {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        });
        let payload = codec::encode_png(&image).unwrap();
        let report = session.propose("cells", Some(&payload), BackendChoice::Fast).await.unwrap();
        assert_eq!(report.count, 1);

        let indices = default_indices(&[], "cells", report.count, session.config().auto_select_top_k);
        let summary = session.select(&indices, Some("cells")).unwrap();
        assert_eq!(summary.applied, 1);
    }
}
