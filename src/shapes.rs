// Path topologies and the procedural shape blocks that emit them.
//
// A topology is the verb skeleton of a path: MOVE/LINE/CLOSE plus how
// many control points each verb consumes. Control point positions are
// a vec2 field over a control-domain instance, computed per lane by a
// vertex kernel; the topology itself is pure structure and lives in
// the program's dynamic topology registry.

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathVerb {
    Move,
    Line,
    Close,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PathTopology {
    pub name: String,
    pub verbs: Vec<PathVerb>,
    pub points_per_verb: Vec<u32>,
    pub total_control_points: usize,
}

// Closed N-gon: MOVE, LINE x (N-1), CLOSE.
pub fn polygon_topology(sides: usize) -> PathTopology {
    let mut verbs = vec![PathVerb::Move];
    let mut points = vec![1u32];
    for _ in 1..sides {
        verbs.push(PathVerb::Line);
        points.push(1);
    }
    verbs.push(PathVerb::Close);
    points.push(0);
    PathTopology {
        name: format!("polygon-{}", sides),
        verbs,
        points_per_verb: points,
        total_control_points: sides,
    }
}

// Star with N points: the outline alternates outer and inner radius
// vertices, so it is a closed 2N-gon over a different vertex kernel.
pub fn star_topology(points: usize) -> PathTopology {
    let vertices = points * 2;
    let mut verbs = vec![PathVerb::Move];
    let mut ppv = vec![1u32];
    for _ in 1..vertices {
        verbs.push(PathVerb::Line);
        ppv.push(1);
    }
    verbs.push(PathVerb::Close);
    ppv.push(0);
    PathTopology {
        name: format!("star-{}", points),
        verbs,
        points_per_verb: ppv,
        total_control_points: vertices,
    }
}

// ---------------------------------------------------------------------------
// Procedural shape blocks
// ---------------------------------------------------------------------------

use crate::ir::{Intrinsic, KernelName, KernelRef, ValueExpr};
use crate::lower::{LowerCtx, Lowered, ValueRef};
use crate::registry::{
    BlockDef, InputDef, InstanceSpec, OutputDef, PortCard, PortType, Registry,
};
use crate::types::{CanonType, Domain, Payload, SpaceUnit, Unit};

pub fn register(reg: &mut Registry) {
    reg.register(def_procedural_polygon())
        .expect("builtin shape definition is valid");
    reg.register(def_procedural_star())
        .expect("builtin shape definition is valid");
}

fn def_procedural_polygon() -> BlockDef {
    BlockDef::new("ProceduralPolygon", lower_procedural_polygon)
        .label("Polygon")
        .category("shape")
        .description("A closed regular polygon with per-axis radius.")
        .instance_spec(InstanceSpec {
            domain: Domain::Control,
            count_key: "sides",
            default_count: 5,
            count_scale: 1,
        })
        .input(
            "radiusX",
            InputDef::new(PortType::fixed(Payload::Float).card(PortCard::Signal))
                .default_const(1.0),
        )
        .input(
            "radiusY",
            InputDef::new(PortType::fixed(Payload::Float).card(PortCard::Signal))
                .default_const(1.0),
        )
        .output(
            "shape",
            OutputDef::new(PortType::fixed(Payload::Shape).card(PortCard::Signal)),
        )
}

fn def_procedural_star() -> BlockDef {
    BlockDef::new("ProceduralStar", lower_procedural_star)
        .label("Star")
        .category("shape")
        .description("A star alternating outer and inner radius vertices.")
        .instance_spec(InstanceSpec {
            domain: Domain::Control,
            count_key: "points",
            default_count: 5,
            count_scale: 2,
        })
        .input(
            "outerRadius",
            InputDef::new(PortType::fixed(Payload::Float).card(PortCard::Signal))
                .default_const(1.0),
        )
        .input(
            "innerRadius",
            InputDef::new(PortType::fixed(Payload::Float).card(PortCard::Signal))
                .default_const(0.5),
        )
        .output(
            "shape",
            OutputDef::new(PortType::fixed(Payload::Shape).card(PortCard::Signal)),
        )
}

// Shared shell of the two lowerings: per-lane index zipped with the
// two radius signals through the vertex kernel, wrapped in a
// ShapeRef over the registered topology.
fn lower_shape(
    ctx: &mut LowerCtx,
    topo: PathTopology,
    kernel: KernelName,
    radius_a: &str,
    radius_b: &str,
) -> Result<Lowered, String> {
    let (instance, domain, count) = ctx
        .instance()
        .ok_or_else(|| String::from("shape block has no control instance"))?;
    if count != topo.total_control_points {
        return Err(format!(
            "control instance has {} lanes, topology needs {}",
            count, topo.total_control_points
        ));
    }
    let a = ctx.require_input(radius_a)?.id();
    let b = ctx.require_input(radius_b)?.id();

    let lane_ty = CanonType::field(Payload::Float, Unit::Count, instance, domain);
    let lane = ctx.ir.intrinsic(Intrinsic::LaneIndex, lane_ty);
    let ctrl_ty = CanonType::field(
        Payload::Vec2,
        Unit::Space(SpaceUnit::Local),
        instance,
        domain,
    );
    let control = ctx
        .ir
        .zip_sig(lane, vec![a, b], KernelRef::Named(kernel), ctrl_ty);

    let topology = ctx.ir.register_topology(topo);
    let shape_ty = ctx.out_type("shape")?;
    let shape = ctx.ir.expr(ValueExpr::ShapeRef {
        topology,
        params: vec![a, b],
        control: Some(control),
        ty: shape_ty,
    });
    Ok(Lowered::new().out("shape", ValueRef::new(shape, shape_ty)?))
}

fn lower_procedural_polygon(ctx: &mut LowerCtx) -> Result<Lowered, String> {
    let sides = ctx.cfg_usize("sides").unwrap_or(5);
    if sides < 3 {
        return Err(format!("sides must be at least 3, got {}", sides));
    }
    lower_shape(
        ctx,
        polygon_topology(sides),
        KernelName::PolygonVertex,
        "radiusX",
        "radiusY",
    )
}

fn lower_procedural_star(ctx: &mut LowerCtx) -> Result<Lowered, String> {
    let points = ctx.cfg_usize("points").unwrap_or(5);
    if points < 3 {
        return Err(format!("points must be at least 3, got {}", points));
    }
    lower_shape(
        ctx,
        star_topology(points),
        KernelName::StarVertex,
        "outerRadius",
        "innerRadius",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polygon_topology() {
        let t = polygon_topology(5);
        assert_eq!(t.name, "polygon-5");
        assert_eq!(
            t.verbs,
            vec![
                PathVerb::Move,
                PathVerb::Line,
                PathVerb::Line,
                PathVerb::Line,
                PathVerb::Line,
                PathVerb::Close
            ]
        );
        assert_eq!(t.points_per_verb, vec![1, 1, 1, 1, 1, 0]);
        assert_eq!(t.total_control_points, 5);
    }

    #[test]
    fn test_star_topology() {
        let t = star_topology(3);
        assert_eq!(t.name, "star-3");
        assert_eq!(t.verbs.len(), 7);
        assert_eq!(t.total_control_points, 6);
        assert_eq!(t.points_per_verb.iter().sum::<u32>(), 6);
    }
}
