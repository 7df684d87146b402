//! Clip a rotated rectangle against a box and print the resulting polygon.
//!
//! ```sh
//! cargo run --example clip -- --angle 30 --width 200 --height 100 --clip 0,0,150,150
//! ```

use clap::Parser;
use scanout_planner::backend::renderer::clip::{clip_quad, ClipBox, ClipVertex, Quad};

#[derive(Debug, Parser)]
#[command(about = "Clip a rotated quad against an axis aligned box")]
struct Args {
    /// Rotation around the quad's centre, in degrees
    #[arg(long, default_value_t = 0.0)]
    angle: f32,
    /// Width of the quad
    #[arg(long, default_value_t = 100.0)]
    width: f32,
    /// Height of the quad
    #[arg(long, default_value_t = 100.0)]
    height: f32,
    /// Centre of the quad as `x,y`
    #[arg(long, default_value = "50,50", value_parser = parse_point)]
    center: (f32, f32),
    /// Clip box as `x1,y1,x2,y2`
    #[arg(long, default_value = "0,0,100,100", value_parser = parse_box)]
    clip: ClipBox,
}

fn parse_numbers<const N: usize>(s: &str) -> Result<[f32; N], String> {
    let values = s
        .split(',')
        .map(|v| v.trim().parse::<f32>().map_err(|err| format!("{v:?}: {err}")))
        .collect::<Result<Vec<_>, _>>()?;
    values
        .try_into()
        .map_err(|values: Vec<f32>| format!("expected {N} numbers, got {}", values.len()))
}

fn parse_point(s: &str) -> Result<(f32, f32), String> {
    let [x, y] = parse_numbers::<2>(s)?;
    Ok((x, y))
}

fn parse_box(s: &str) -> Result<ClipBox, String> {
    let [x1, y1, x2, y2] = parse_numbers::<4>(s)?;
    Ok(ClipBox::new(x1, y1, x2, y2))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let (sin, cos) = args.angle.to_radians().sin_cos();
    let (cx, cy) = args.center;
    let (hw, hh) = (args.width / 2.0, args.height / 2.0);
    let corners = [(-hw, -hh), (hw, -hh), (hw, hh), (-hw, hh)]
        .map(|(x, y)| ClipVertex::new(cx + x * cos - y * sin, cy + x * sin + y * cos));
    let axis_aligned = (args.angle % 90.0).abs() < f32::EPSILON;
    let quad = Quad::new(corners, axis_aligned);

    let polygon = clip_quad(&quad, &args.clip);
    if polygon.is_empty() {
        println!("nothing left after clipping");
        return;
    }
    println!("{} vertices:", polygon.len());
    for v in &polygon {
        println!("  ({:.3}, {:.3})", v.x, v.y);
    }
}
