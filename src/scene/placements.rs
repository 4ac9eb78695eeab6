use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use glam::Vec3;
use log::{debug, warn};

/// Where to put one instance of the mesh, and which way is up for it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstancePlacement {
    pub position: Vec3,
    pub normal: Vec3,
}

impl InstancePlacement {
    pub const DEFAULT_NORMAL: Vec3 = Vec3::Y;
}

pub fn load_placements(path: impl AsRef<Path>) -> Result<Vec<InstancePlacement>> {
    let path = path.as_ref();
    let file =
        File::open(path).with_context(|| format!("opening placements {}", path.display()))?;
    let placements = parse_placements(BufReader::new(file))
        .with_context(|| format!("loading placements {}", path.display()))?;

    debug!("loaded {} placements from {}", placements.len(), path.display());
    Ok(placements)
}

/// Reads an OBJ file as a flat point cloud: the n-th `v` line pairs with the
/// n-th `vn` line. Faces and every other statement are ignored.
pub fn parse_placements(reader: impl BufRead) -> Result<Vec<InstancePlacement>> {
    let mut positions = Vec::new();
    let mut normals = Vec::new();

    for (line_i, line) in reader.lines().enumerate() {
        let line = line?;
        let mut tokens = line.split_ascii_whitespace();

        match tokens.next() {
            // positions may carry extra per-vertex colour components, which we drop
            Some("v") => positions.push(
                parse_vec3(&mut tokens).with_context(|| format!("line {}", line_i + 1))?,
            ),
            Some("vn") => {
                normals.push(
                    parse_vec3(&mut tokens).with_context(|| format!("line {}", line_i + 1))?,
                );
                if tokens.next().is_some() {
                    bail!("line {}: vn requires only x y z", line_i + 1);
                }
            }
            _ => (),
        }
    }

    if positions.is_empty() {
        warn!("placement file has no positions, the scene will be empty");
        return Ok(Vec::new());
    }

    if normals.is_empty() {
        warn!(
            "placement file has no normals, orienting all {} instances along {}",
            positions.len(),
            InstancePlacement::DEFAULT_NORMAL
        );
    } else if normals.len() != positions.len() {
        warn!(
            "placement file has {} positions but {} normals",
            positions.len(),
            normals.len()
        );
    }

    let placements = positions
        .into_iter()
        .enumerate()
        .map(|(i, position)| {
            let normal = match normals.get(i) {
                Some(n) if n.length_squared() > 0.0 => *n,
                Some(_) => {
                    warn!("placement {i} has a zero normal, using the default");
                    InstancePlacement::DEFAULT_NORMAL
                }
                None => InstancePlacement::DEFAULT_NORMAL,
            };
            InstancePlacement { position, normal }
        })
        .collect();

    Ok(placements)
}

fn parse_f32<'a>(mut tokens: impl Iterator<Item = &'a str>) -> Result<f32> {
    let num = tokens
        .next()
        .ok_or(anyhow!("float expected but not found"))?;
    num.parse()
        .with_context(|| format!("invalid float {num:?}"))
}

fn parse_vec3<'a>(mut tokens: impl Iterator<Item = &'a str>) -> Result<Vec3> {
    let x = parse_f32(&mut tokens)?;
    let y = parse_f32(&mut tokens)?;
    let z = parse_f32(&mut tokens)?;
    Ok(Vec3::new(x, y, z))
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::{parse_placements, InstancePlacement};

    #[test]
    fn pairs_positions_with_normals() {
        let placements = parse_placements(
            "
            # scattered points
            v 1 2 3
            v -1 0 4.5
            vn 0 1 0
            vn 1 0 0
            f 1 2 1
            "
            .as_bytes(),
        )
        .expect("failed to parse");

        assert_eq!(
            placements,
            [
                InstancePlacement {
                    position: Vec3::new(1.0, 2.0, 3.0),
                    normal: Vec3::Y,
                },
                InstancePlacement {
                    position: Vec3::new(-1.0, 0.0, 4.5),
                    normal: Vec3::X,
                },
            ]
        );
    }

    #[test]
    fn missing_normals_default_to_up() {
        let placements = parse_placements("v 0 0 0\nv 1 1 1 0.5 0.5 0.5\nvn 0 0 2\n".as_bytes())
            .expect("failed to parse");

        assert_eq!(placements.len(), 2);
        assert_eq!(placements[0].normal, Vec3::new(0.0, 0.0, 2.0));
        assert_eq!(placements[1].normal, InstancePlacement::DEFAULT_NORMAL);
    }

    #[test]
    fn zero_normal_is_replaced() {
        let placements = parse_placements("v 0 0 0\nvn 0 0 0\n".as_bytes()).unwrap();
        assert_eq!(placements[0].normal, InstancePlacement::DEFAULT_NORMAL);
    }

    #[test]
    fn empty_file_yields_no_placements() {
        assert!(parse_placements("".as_bytes()).unwrap().is_empty());
        assert!(parse_placements("vn 0 1 0\n".as_bytes()).unwrap().is_empty());
    }

    #[test]
    fn malformed_numbers_are_fatal() {
        let err = parse_placements("v 0 zero 0\n".as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("line 1"));
        assert!(parse_placements("v 0 0\n".as_bytes()).is_err());
        assert!(parse_placements("vn 0 1 0 1\n".as_bytes()).is_err());
    }

    #[test]
    fn bundled_placements_load() {
        let placements = super::load_placements(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/resources/placements.obj"
        ))
        .unwrap();
        assert_eq!(placements.len(), 5);
        assert_eq!(placements[4].normal, Vec3::Z);
    }
}
