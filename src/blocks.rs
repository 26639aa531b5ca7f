// (C) 2020 Brandon Lewis
//
// The stock block set.
//
// Sources read external channels or synthesize values, the math
// family is cardinality-generic (scalar opcodes on signals, field
// kernels on fields), shape blocks live in shapes.rs, and the state,
// event, camera and render blocks round out the contract surface.
// Everything here goes through the same declarative lowering API;
// RenderInstances2D keeps the imperative emitters honest.
//
// Dispatch inside the shared lowering functions is by block type
// name. A fn pointer cannot close over per-block constants, and a
// visible match table reads better than a constellation of one-line
// functions anyway.

use crate::ir::{
    CameraProjection, ConstVal, Intrinsic, KernelName, KernelRef, OpCode, RenderGlobal, StateKey,
    ValueExpr,
};
use crate::lower::{LowerCtx, Lowered, ValueRef};
use crate::registry::{
    AdapterSpec, BlockDef, Capability, CardinalityConstraint, CardinalityInfo, Config, Expansion,
    InputDef, InstanceSpec, OutputDef, PayloadSemantics, PayloadSpec, PortCard, PortType, Registry,
    VarargConstraint,
};
use crate::types::{
    AngleUnit, CanonType, ColorSpaceUnit, Contract, Domain, Payload, SpaceUnit, TimeUnit, Unit,
};

// Golden angle, in turns.
const GOLDEN_TURNS: f64 = 0.3819660112501051;

pub fn register_all(reg: &mut Registry) {
    let defs = vec![
        def_const(),
        def_const_int(),
        def_time(),
        def_external_input(),
        def_external_gate(),
        def_external_vec2(),
        def_external_event(),
        def_expression(),
        def_unary_math("Sin", "theta", Unit::Angle(AngleUnit::Radians), "out", Unit::Scalar),
        def_unary_math("Cos", "theta", Unit::Angle(AngleUnit::Radians), "out", Unit::Scalar),
        def_mod(),
        def_radius_sqrt(),
        def_pulse(),
        def_golden_angle(),
        def_angular_offset(),
        def_hue_from_phase(),
        def_jitter_vec(),
        def_set_z(),
        def_polar_to_cartesian(),
        def_cartesian_to_polar(),
        def_array(),
        def_sample_hold(),
        def_event_to_signal_mask(),
        def_camera(),
        def_render_instances_2d(),
        def_oscillator(),
    ];
    for def in defs {
        reg.register(def).expect("builtin block definition is valid");
    }
    crate::shapes::register(reg);
    register_adapters(reg);
}

// ---------------------------------------------------------------------------
// Shared lowering helpers
// ---------------------------------------------------------------------------

fn float_sig() -> CanonType {
    CanonType::new(Payload::Float)
}

// Combine already-resolved inputs elementwise. By the time lowering
// runs, the solver has either kept everything a signal or lifted
// every wired input into the same field instance, so the two paths
// are: all signals (scalar opcode) or all fields (field kernel).
fn elementwise(
    ctx: &mut LowerCtx,
    inputs: &[&ValueRef],
    op: Option<OpCode>,
    kernel: Option<KernelName>,
    out_port: &'static str,
) -> Result<ValueRef, String> {
    let out_ty = ctx.out_type(out_port)?;
    let any_field = inputs.iter().any(|v| v.is_field());
    let kref = if any_field {
        kernel
            .map(KernelRef::Named)
            .or_else(|| op.map(KernelRef::Op))
            .ok_or_else(|| String::from("no field kernel for this operation"))?
    } else {
        op.map(KernelRef::Op)
            .or_else(|| kernel.map(KernelRef::Named))
            .ok_or_else(|| String::from("no scalar opcode for this operation"))?
    };
    if any_field {
        let instances: Vec<_> = inputs.iter().filter_map(|v| v.ty().instance()).collect();
        if instances.windows(2).any(|w| w[0] != w[1]) || instances.len() != inputs.len() {
            return Err(String::from("field inputs span different instances"));
        }
    }
    let ids: Vec<_> = inputs.iter().map(|v| v.id()).collect();
    let expr = if ids.len() == 1 {
        ctx.ir.map(ids[0], kref, out_ty)
    } else {
        ctx.ir.zip(ids, kref, out_ty)
    };
    ValueRef::new(expr, out_ty)
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

fn def_const() -> BlockDef {
    BlockDef::new("Const", lower_const)
        .label("Constant")
        .category("source")
        .description("A constant value of any scalar or vector payload.")
        .payload_spec(PayloadSpec {
            allowed: vec![(
                "out",
                Payload::Float | Payload::Int | Payload::Bool | Payload::Vec2 | Payload::Vec3
                    | Payload::Color,
            )],
            semantics: PayloadSemantics::Componentwise,
        })
        .output("out", OutputDef::new(PortType::generic()))
}

fn lower_const(ctx: &mut LowerCtx) -> Result<Lowered, String> {
    let out_ty = ctx.out_type("out")?;
    let payload = out_ty
        .payload
        .fixed()
        .ok_or_else(|| String::from("unresolved payload"))?;
    let value = const_from_config(ctx.config, payload)?;
    let e = ctx.ir.const_val(value, out_ty);
    Ok(Lowered::new().out("out", ValueRef::new(e, out_ty)?))
}

fn const_from_config(config: &Config, payload: Payload) -> Result<ConstVal, String> {
    let raw = config.get("value");
    let scalar = raw.and_then(|v| v.as_f64()).unwrap_or(0.0);
    let lanes = |n: usize| -> Result<Vec<f64>, String> {
        match raw.and_then(|v| v.as_array()) {
            Some(items) if items.len() == n => items
                .iter()
                .map(|v| v.as_f64().ok_or_else(|| String::from("non-numeric component")))
                .collect(),
            Some(items) => Err(format!("expected {} components, got {}", n, items.len())),
            None => Ok(vec![scalar; n]),
        }
    };
    Ok(match payload {
        Payload::Float => ConstVal::Float(scalar),
        Payload::Int => ConstVal::Int(scalar as i64),
        Payload::Bool => ConstVal::Bool(scalar != 0.0),
        Payload::Vec2 => {
            let v = lanes(2)?;
            ConstVal::Vec2([v[0], v[1]])
        }
        Payload::Vec3 => {
            let v = lanes(3)?;
            ConstVal::Vec3([v[0], v[1], v[2]])
        }
        Payload::Color => {
            let v = lanes(4)?;
            ConstVal::Color([v[0], v[1], v[2], v[3]])
        }
        other => return Err(format!("constant cannot carry payload {:?}", other)),
    })
}

fn def_const_int() -> BlockDef {
    BlockDef::new("ConstInt", lower_const_int)
        .label("Integer constant")
        .category("source")
        .output(
            "out",
            OutputDef::new(PortType::fixed(Payload::Int).card(PortCard::Signal)),
        )
}

fn lower_const_int(ctx: &mut LowerCtx) -> Result<Lowered, String> {
    let out_ty = ctx.out_type("out")?;
    let v = ctx.cfg_f64_or("value", 0.0) as i64;
    let e = ctx.ir.const_val(ConstVal::Int(v), out_ty);
    Ok(Lowered::new().out("out", ValueRef::new(e, out_ty)?))
}

fn def_time() -> BlockDef {
    BlockDef::new("Time", lower_time)
        .label("Time")
        .category("source")
        .description("The time root: seconds since the program started.")
        .capability(Capability::Time)
        .output(
            "t",
            OutputDef::new(
                PortType::fixed(Payload::Float)
                    .unit(Unit::Time(TimeUnit::Seconds))
                    .card(PortCard::Signal),
            ),
        )
}

fn lower_time(ctx: &mut LowerCtx) -> Result<Lowered, String> {
    let ty = ctx.out_type("t")?;
    let e = ctx.ir.intrinsic(Intrinsic::Time, ty);
    Ok(Lowered::new().out("t", ValueRef::new(e, ty)?))
}

fn def_external_input() -> BlockDef {
    BlockDef::new("ExternalInput", lower_external_input)
        .label("External input")
        .category("source")
        .description("Reads one float channel from the host.")
        .capability(Capability::Io)
        .output(
            "value",
            OutputDef::new(PortType::fixed(Payload::Float).card(PortCard::Signal)),
        )
}

fn lower_external_input(ctx: &mut LowerCtx) -> Result<Lowered, String> {
    let channel = ctx
        .cfg_str("channel")
        .ok_or_else(|| String::from("missing channel"))?
        .to_string();
    let ty = ctx.out_type("value")?;
    let e = ctx.ir.external(channel, ty);
    Ok(Lowered::new().out("value", ValueRef::new(e, ty)?))
}

fn def_external_gate() -> BlockDef {
    BlockDef::new("ExternalGate", lower_external_gate)
        .label("External gate")
        .category("source")
        .description("Thresholds a channel into a 0/1 gate; the boundary is inclusive.")
        .capability(Capability::Io)
        .output(
            "gate",
            OutputDef::new(
                PortType::fixed(Payload::Float)
                    .card(PortCard::Signal)
                    .contract(Contract::Clamp01),
            ),
        )
}

fn lower_external_gate(ctx: &mut LowerCtx) -> Result<Lowered, String> {
    let channel = ctx
        .cfg_str("channel")
        .ok_or_else(|| String::from("missing channel"))?
        .to_string();
    let threshold = ctx.cfg_f64_or("threshold", 0.5);
    let ty = ctx.out_type("gate")?;

    // gate = 1 - (threshold > input), so input >= threshold opens it.
    let input = ctx.ir.external(channel, float_sig());
    let thresh = ctx.ir.const_f64(threshold, float_sig());
    let one = ctx.ir.const_f64(1.0, float_sig());
    let gt = ctx
        .ir
        .zip(vec![thresh, input], KernelRef::Op(OpCode::Gt), float_sig());
    let gate = ctx.ir.zip(vec![one, gt], KernelRef::Op(OpCode::Sub), ty);
    Ok(Lowered::new().out("gate", ValueRef::new(gate, ty)?))
}

fn def_external_vec2() -> BlockDef {
    BlockDef::new("ExternalVec2", lower_external_vec2)
        .label("External vec2")
        .category("source")
        .description("Packs <base>.x and <base>.y channels into one vec2.")
        .capability(Capability::Io)
        .output(
            "value",
            OutputDef::new(PortType::fixed(Payload::Vec2).card(PortCard::Signal)),
        )
}

fn lower_external_vec2(ctx: &mut LowerCtx) -> Result<Lowered, String> {
    let base = ctx
        .cfg_str("channelBase")
        .ok_or_else(|| String::from("missing channelBase"))?
        .to_string();
    let ty = ctx.out_type("value")?;
    let x = ctx.ir.external(format!("{}.x", base), float_sig());
    let y = ctx.ir.external(format!("{}.y", base), float_sig());
    let packed = ctx.ir.construct(vec![x, y], ty);
    Ok(Lowered::new().out("value", ValueRef::new(packed, ty)?))
}

fn def_external_event() -> BlockDef {
    BlockDef::new("ExternalEvent", lower_external_event)
        .label("External event")
        .category("source")
        .description("A discrete occurrence fed by the host.")
        .capability(Capability::Io)
        .output("event", OutputDef::new(PortType::event()))
}

fn lower_external_event(ctx: &mut LowerCtx) -> Result<Lowered, String> {
    let channel = ctx
        .cfg_str("channel")
        .ok_or_else(|| String::from("missing channel"))?
        .to_string();
    let ty = ctx.out_type("event")?;
    let id = ctx.ir.event_channel(&channel);
    let e = ctx.ir.event_read(id, ty);
    Ok(Lowered::new().out("event", ValueRef::new(e, ty)?))
}

// ---------------------------------------------------------------------------
// Expression
// ---------------------------------------------------------------------------

fn def_expression() -> BlockDef {
    BlockDef::new("Expression", lower_expression)
        .label("Expression")
        .category("math")
        .description("A little arithmetic language over in0, in1 and refs.")
        .payload_spec(PayloadSpec {
            allowed: vec![
                ("in0", Payload::Float | Payload::Int),
                ("in1", Payload::Float | Payload::Int),
                ("out", Payload::Float | Payload::Int),
            ],
            semantics: PayloadSemantics::Componentwise,
        })
        .input("in0", InputDef::new(PortType::generic()).optional())
        .input("in1", InputDef::new(PortType::generic()).optional())
        .input(
            "refs",
            InputDef::new(PortType::fixed(Payload::Float)).vararg(VarargConstraint {
                payloads: Payload::Float.into(),
                card: CardinalityConstraint::Any,
                min: 0,
                max: Some(8),
            }),
        )
        .output("out", OutputDef::new(PortType::generic()))
}

fn lower_expression(ctx: &mut LowerCtx) -> Result<Lowered, String> {
    let text = ctx.cfg_str("expression").unwrap_or("").to_string();
    let out_ty = ctx.out_type("out")?;

    if text.trim().is_empty() {
        let zero = match out_ty.payload.fixed() {
            Some(Payload::Int) => ConstVal::Int(0),
            _ => ConstVal::Float(0.0),
        };
        let e = ctx.ir.const_val(zero, out_ty);
        return Ok(Lowered::new().out("out", ValueRef::new(e, out_ty)?));
    }

    let ast = crate::parser::parse(&text).map_err(|e| format!("Syntax {}", e))?;
    let value = eval_expr(ctx, &ast)?;
    if value.is_field() && !out_ty.is_field() {
        return Err(String::from(
            "field reference requires a field-typed output; wire a field to in0 or in1",
        ));
    }
    Ok(Lowered::new().out("out", value))
}

fn eval_expr(ctx: &mut LowerCtx, expr: &crate::ast::Expr) -> Result<ValueRef, String> {
    use crate::ast::Expr;
    match expr {
        Expr::Int(v) => {
            let ty = match ctx.out_type("out")?.payload.fixed() {
                Some(Payload::Int) => CanonType::new(Payload::Int),
                _ => float_sig(),
            };
            let value = match ty.payload.fixed() {
                Some(Payload::Int) => ConstVal::Int(*v),
                _ => ConstVal::Float(*v as f64),
            };
            let e = ctx.ir.const_val(value, ty);
            ValueRef::new(e, ty)
        }
        Expr::Float(v) => {
            let e = ctx.ir.const_f64(*v, float_sig());
            ValueRef::new(e, float_sig())
        }
        Expr::Id(name) => resolve_identifier(ctx, name),
        Expr::Unary(op, inner) => {
            let value = eval_expr(ctx, inner)?;
            let opcode = match op {
                crate::ast::UnOp::Neg => OpCode::Neg,
            };
            let e = ctx.ir.map(value.id(), KernelRef::Op(opcode), value.ty());
            ValueRef::new(e, value.ty())
        }
        Expr::Binary(op, l, r) => {
            let lv = eval_expr(ctx, l)?;
            let rv = eval_expr(ctx, r)?;
            combine(ctx, opcode_of(*op), &lv, &rv)
        }
        Expr::Call(name, args) => {
            let opcode = function_of(name)?;
            if args.len() != opcode.arity() {
                return Err(format!(
                    "{} takes {} arguments, got {}",
                    name,
                    opcode.arity(),
                    args.len()
                ));
            }
            let values: Vec<ValueRef> = args
                .iter()
                .map(|a| eval_expr(ctx, a))
                .collect::<Result<_, _>>()?;
            match values.len() {
                1 => {
                    let v = &values[0];
                    let e = ctx.ir.map(v.id(), KernelRef::Op(opcode), v.ty());
                    ValueRef::new(e, v.ty())
                }
                2 => combine(ctx, opcode, &values[0], &values[1]),
                _ => {
                    // Ternary and up: fold fields like combine does.
                    let ty = values
                        .iter()
                        .find(|v| v.is_field())
                        .map(|v| v.ty())
                        .unwrap_or_else(|| values[0].ty());
                    let ids = values.iter().map(|v| v.id()).collect();
                    let e = ctx.ir.zip(ids, KernelRef::Op(opcode), ty);
                    ValueRef::new(e, ty)
                }
            }
        }
    }
}

fn resolve_identifier(ctx: &mut LowerCtx, name: &str) -> Result<ValueRef, String> {
    match name {
        "pi" => {
            let e = ctx.ir.const_f64(std::f64::consts::PI, float_sig());
            return ValueRef::new(e, float_sig());
        }
        "tau" => {
            let e = ctx.ir.const_f64(std::f64::consts::TAU, float_sig());
            return ValueRef::new(e, float_sig());
        }
        "in0" | "in1" => {
            return ctx
                .input(name)
                .cloned()
                .ok_or_else(|| format!("unknown identifier {} (input not connected)", name));
        }
        _ => {}
    }
    if let Some(rest) = name.strip_prefix('r') {
        if let Ok(i) = rest.parse::<usize>() {
            return ctx
                .vararg("refs")
                .get(i)
                .cloned()
                .ok_or_else(|| format!("reference r{} is not connected", i));
        }
    }
    Err(format!("unknown identifier {}", name))
}

// Zip two values, lifting a lone signal across the other side's
// lanes with ZipSig.
fn combine(
    ctx: &mut LowerCtx,
    opcode: OpCode,
    l: &ValueRef,
    r: &ValueRef,
) -> Result<ValueRef, String> {
    let lp = l.ty().payload.fixed();
    let rp = r.ty().payload.fixed();
    if lp != rp {
        return Err(format!(
            "operands disagree on payload ({:?} vs {:?})",
            lp, rp
        ));
    }
    let kref = KernelRef::Op(opcode);
    match (l.is_field(), r.is_field()) {
        (false, false) => {
            let e = ctx.ir.zip(vec![l.id(), r.id()], kref, l.ty());
            ValueRef::new(e, l.ty())
        }
        (true, true) => {
            if l.ty().instance() != r.ty().instance() {
                return Err(String::from("field operands span different instances"));
            }
            let e = ctx.ir.zip(vec![l.id(), r.id()], kref, l.ty());
            ValueRef::new(e, l.ty())
        }
        (true, false) => {
            let e = ctx.ir.zip_sig(l.id(), vec![r.id()], kref, l.ty());
            ValueRef::new(e, l.ty())
        }
        (false, true) => {
            let e = ctx.ir.zip_sig(r.id(), vec![l.id()], kref, r.ty());
            ValueRef::new(e, r.ty())
        }
    }
}

fn opcode_of(op: crate::ast::BinOp) -> OpCode {
    use crate::ast::BinOp;
    match op {
        BinOp::Add => OpCode::Add,
        BinOp::Sub => OpCode::Sub,
        BinOp::Mul => OpCode::Mul,
        BinOp::Div => OpCode::Div,
        BinOp::Mod => OpCode::Mod,
        BinOp::Lt => OpCode::Lt,
        BinOp::Gt => OpCode::Gt,
        BinOp::Lte => OpCode::Lte,
        BinOp::Gte => OpCode::Gte,
        BinOp::Eq => OpCode::Eq,
    }
}

fn function_of(name: &str) -> Result<OpCode, String> {
    Ok(match name {
        "sin" => OpCode::Sin,
        "cos" => OpCode::Cos,
        "sqrt" => OpCode::Sqrt,
        "abs" => OpCode::Abs,
        "floor" => OpCode::Floor,
        "min" => OpCode::Min,
        "max" => OpCode::Max,
        "lerp" => OpCode::Lerp,
        _ => return Err(format!("unknown function {}", name)),
    })
}

// ---------------------------------------------------------------------------
// Cardinality-generic math
// ---------------------------------------------------------------------------

fn math_payloads(ports: &[&'static str]) -> PayloadSpec {
    PayloadSpec {
        allowed: ports.iter().map(|p| (*p, Payload::Float.into())).collect(),
        semantics: PayloadSemantics::Componentwise,
    }
}

fn def_unary_math(
    name: &'static str,
    in_port: &'static str,
    in_unit: Unit,
    out_port: &'static str,
    out_unit: Unit,
) -> BlockDef {
    BlockDef::new(name, lower_math)
        .category("math")
        .payload_spec(math_payloads(&[in_port, out_port]))
        .input(
            in_port,
            InputDef::new(PortType::generic().unit(in_unit)).default_const(0.0),
        )
        .output(out_port, OutputDef::new(PortType::generic().unit(out_unit)))
}

fn def_mod() -> BlockDef {
    BlockDef::new("Mod", lower_math)
        .category("math")
        .payload_spec(math_payloads(&["a", "b", "out"]))
        .input("a", InputDef::new(PortType::generic()))
        .input("b", InputDef::new(PortType::generic()).default_const(1.0))
        .output("out", OutputDef::new(PortType::generic()))
}

fn def_radius_sqrt() -> BlockDef {
    BlockDef::new("RadiusSqrt", lower_math)
        .category("math")
        .description("Square-root falloff for evenly filled disks.")
        .payload_spec(math_payloads(&["t", "radius"]))
        .input(
            "t",
            InputDef::new(PortType::generic().unit(Unit::Norm01)).default_const(0.0),
        )
        .output("radius", OutputDef::new(PortType::generic().unit(Unit::Scalar)))
}

fn def_pulse() -> BlockDef {
    BlockDef::new("Pulse", lower_math)
        .category("math")
        .description("1 while phase is inside the pulse width, else 0.")
        .payload_spec(math_payloads(&["phase", "width", "out"]))
        .input(
            "phase",
            InputDef::new(PortType::generic().unit(Unit::Norm01)),
        )
        .input(
            "width",
            InputDef::new(PortType::generic().unit(Unit::Norm01)).default_const(0.5),
        )
        .output(
            "out",
            OutputDef::new(PortType::generic().contract(Contract::Clamp01)),
        )
}

fn def_golden_angle() -> BlockDef {
    BlockDef::new("GoldenAngle", lower_math)
        .category("math")
        .description("n times the golden angle, in turns.")
        .payload_spec(math_payloads(&["n", "angle"]))
        .input("n", InputDef::new(PortType::generic().unit(Unit::Count)))
        .output(
            "angle",
            OutputDef::new(PortType::generic().unit(Unit::Angle(AngleUnit::Turns))),
        )
}

fn def_angular_offset() -> BlockDef {
    BlockDef::new("AngularOffset", lower_math)
        .category("math")
        .payload_spec(math_payloads(&["angle", "offset", "out"]))
        .input(
            "angle",
            InputDef::new(PortType::generic().unit(Unit::Angle(AngleUnit::Turns))),
        )
        .input(
            "offset",
            InputDef::new(PortType::generic().unit(Unit::Angle(AngleUnit::Turns)))
                .default_const(0.0),
        )
        .output(
            "out",
            OutputDef::new(PortType::generic().unit(Unit::Angle(AngleUnit::Turns))),
        )
}

fn def_hue_from_phase() -> BlockDef {
    BlockDef::new("HueFromPhase", lower_math)
        .category("color")
        .description("Wraps a phase around the hue wheel.")
        .input(
            "phase",
            InputDef::new(PortType::fixed(Payload::Float).unit(Unit::Norm01)),
        )
        .output(
            "color",
            OutputDef::new(
                PortType::fixed(Payload::Color)
                    .unit(Unit::ColorSpace(ColorSpaceUnit::Hsl))
                    .contract(Contract::Clamp01),
            ),
        )
}

fn def_jitter_vec() -> BlockDef {
    BlockDef::new("JitterVec", lower_math)
        .category("math")
        .description("Deterministic per-seed jitter offset.")
        .input("seed", InputDef::new(PortType::fixed(Payload::Float)))
        .input(
            "amount",
            InputDef::new(PortType::fixed(Payload::Float)).default_const(1.0),
        )
        .output(
            "out",
            OutputDef::new(PortType::fixed(Payload::Vec2).unit(Unit::Space(SpaceUnit::Local))),
        )
}

fn def_set_z() -> BlockDef {
    BlockDef::new("SetZ", lower_math)
        .category("math")
        .input(
            "xy",
            InputDef::new(PortType::fixed(Payload::Vec2).unit(Unit::Space(SpaceUnit::World))),
        )
        .input(
            "z",
            InputDef::new(PortType::fixed(Payload::Float)).default_const(0.0),
        )
        .output(
            "out",
            OutputDef::new(PortType::fixed(Payload::Vec3).unit(Unit::Space(SpaceUnit::World))),
        )
}

fn def_polar_to_cartesian() -> BlockDef {
    BlockDef::new("FieldPolarToCartesian", lower_math)
        .category("math")
        .input(
            "angle",
            InputDef::new(PortType::fixed(Payload::Float).unit(Unit::Angle(AngleUnit::Radians))),
        )
        .input(
            "radius",
            InputDef::new(PortType::fixed(Payload::Float).unit(Unit::Scalar)).default_const(1.0),
        )
        .output(
            "pos",
            OutputDef::new(PortType::fixed(Payload::Vec2).unit(Unit::Space(SpaceUnit::World))),
        )
}

fn lower_math(ctx: &mut LowerCtx) -> Result<Lowered, String> {
    match ctx.block_type {
        "Sin" => {
            let theta = ctx.require_input("theta")?.clone();
            let out = elementwise(ctx, &[&theta], Some(OpCode::Sin), Some(KernelName::FieldSin), "out")?;
            Ok(Lowered::new().out("out", out))
        }
        "Cos" => {
            let theta = ctx.require_input("theta")?.clone();
            let out = elementwise(ctx, &[&theta], Some(OpCode::Cos), Some(KernelName::FieldCos), "out")?;
            Ok(Lowered::new().out("out", out))
        }
        "Mod" => {
            let a = ctx.require_input("a")?.clone();
            let b = ctx.require_input("b")?.clone();
            let out = elementwise(ctx, &[&a, &b], Some(OpCode::Mod), Some(KernelName::FieldMod), "out")?;
            Ok(Lowered::new().out("out", out))
        }
        "RadiusSqrt" => {
            let t = ctx.require_input("t")?.clone();
            let out = elementwise(
                ctx,
                &[&t],
                Some(OpCode::Sqrt),
                Some(KernelName::RadiusSqrt),
                "radius",
            )?;
            Ok(Lowered::new().out("radius", out))
        }
        "Pulse" => {
            let phase = ctx.require_input("phase")?.clone();
            let width = ctx.require_input("width")?.clone();
            let out = elementwise(
                ctx,
                &[&phase, &width],
                Some(OpCode::Lt),
                Some(KernelName::FieldPulse),
                "out",
            )?;
            Ok(Lowered::new().out("out", out))
        }
        "GoldenAngle" => {
            let n = ctx.require_input("n")?.clone();
            let out_ty = ctx.out_type("angle")?;
            let e = if n.is_field() {
                ctx.ir
                    .map(n.id(), KernelRef::Named(KernelName::GoldenAngle), out_ty)
            } else {
                let c = ctx.ir.const_f64(
                    GOLDEN_TURNS,
                    CanonType::with_unit(Payload::Float, Unit::Angle(AngleUnit::Turns)),
                );
                ctx.ir.zip(vec![n.id(), c], KernelRef::Op(OpCode::Mul), out_ty)
            };
            Ok(Lowered::new().out("angle", ValueRef::new(e, out_ty)?))
        }
        "AngularOffset" => {
            let angle = ctx.require_input("angle")?.clone();
            let offset = ctx.require_input("offset")?.clone();
            let out = elementwise(
                ctx,
                &[&angle, &offset],
                Some(OpCode::Add),
                Some(KernelName::AngularOffset),
                "out",
            )?;
            Ok(Lowered::new().out("out", out))
        }
        "HueFromPhase" => {
            let phase = ctx.require_input("phase")?.clone();
            let out = elementwise(ctx, &[&phase], None, Some(KernelName::HueFromPhase), "color")?;
            Ok(Lowered::new().out("color", out))
        }
        "JitterVec" => {
            let seed = ctx.require_input("seed")?.clone();
            let amount = ctx.require_input("amount")?.clone();
            let out = elementwise(
                ctx,
                &[&seed, &amount],
                None,
                Some(KernelName::JitterVec),
                "out",
            )?;
            Ok(Lowered::new().out("out", out))
        }
        "SetZ" => {
            let xy = ctx.require_input("xy")?.clone();
            let z = ctx.require_input("z")?.clone();
            let out = elementwise(ctx, &[&xy, &z], None, Some(KernelName::SetZ), "out")?;
            Ok(Lowered::new().out("out", out))
        }
        "FieldPolarToCartesian" => {
            let angle = ctx.require_input("angle")?.clone();
            let radius = ctx.require_input("radius")?.clone();
            let out = elementwise(
                ctx,
                &[&angle, &radius],
                None,
                Some(KernelName::PolarToCartesian),
                "pos",
            )?;
            Ok(Lowered::new().out("pos", out))
        }
        other => Err(format!("no math lowering for {}", other)),
    }
}

fn def_cartesian_to_polar() -> BlockDef {
    BlockDef::new("FieldCartesianToPolar", lower_cartesian_to_polar)
        .category("math")
        .input(
            "pos",
            InputDef::new(PortType::fixed(Payload::Vec2).unit(Unit::Space(SpaceUnit::World))),
        )
        .output(
            "angle",
            OutputDef::new(PortType::fixed(Payload::Float).unit(Unit::Angle(AngleUnit::Radians))),
        )
        .output(
            "radius",
            OutputDef::new(PortType::fixed(Payload::Float).unit(Unit::Scalar)),
        )
}

// The two outputs are distinct expressions over the same source; a
// shared one would alias the lanes.
fn lower_cartesian_to_polar(ctx: &mut LowerCtx) -> Result<Lowered, String> {
    let pos = ctx.require_input("pos")?.clone();
    let angle_ty = ctx.out_type("angle")?;
    let radius_ty = ctx.out_type("radius")?;
    let angle = ctx
        .ir
        .map(pos.id(), KernelRef::Named(KernelName::CartesianAngle), angle_ty);
    let radius = ctx.ir.map(
        pos.id(),
        KernelRef::Named(KernelName::CartesianRadius),
        radius_ty,
    );
    Ok(Lowered::new()
        .out("angle", ValueRef::new(angle, angle_ty)?)
        .out("radius", ValueRef::new(radius, radius_ty)?))
}

// ---------------------------------------------------------------------------
// Structure, state, events, rendering
// ---------------------------------------------------------------------------

fn def_array() -> BlockDef {
    BlockDef::new("Array", lower_array)
        .label("Array")
        .category("structure")
        .description("Declares a field domain of count lanes.")
        .capability(Capability::Identity)
        .instance_spec(InstanceSpec {
            domain: Domain::Default,
            count_key: "count",
            default_count: 8,
            count_scale: 1,
        })
        .input(
            "shape",
            InputDef::new(PortType::fixed(Payload::Shape).card(PortCard::Signal)).optional(),
        )
        .output(
            "index",
            OutputDef::new(
                PortType::fixed(Payload::Float)
                    .unit(Unit::Count)
                    .card(PortCard::Field),
            ),
        )
        .output(
            "count",
            OutputDef::new(
                PortType::fixed(Payload::Float)
                    .unit(Unit::Count)
                    .card(PortCard::Signal),
            ),
        )
}

fn lower_array(ctx: &mut LowerCtx) -> Result<Lowered, String> {
    let (instance, _, count) = ctx
        .instance()
        .ok_or_else(|| String::from("array has no instance"))?;
    let index_ty = ctx.out_type("index")?;
    let count_ty = ctx.out_type("count")?;
    let index = ctx.ir.intrinsic(Intrinsic::LaneIndex, index_ty);
    let count_expr = ctx.ir.const_f64(count as f64, count_ty);
    if let Some(shape) = ctx.input("shape") {
        let shape_id = shape.id();
        ctx.ir.set_instance_shape(instance, shape_id)?;
    }
    Ok(Lowered::new()
        .out("index", ValueRef::new(index, index_ty)?)
        .out("count", ValueRef::new(count_expr, count_ty)?))
}

fn def_sample_hold() -> BlockDef {
    BlockDef::new("SampleHold", lower_sample_hold)
        .label("Sample & hold")
        .category("state")
        .description("Freezes the input while the trigger is low.")
        .capability(Capability::State)
        .cardinality(CardinalityInfo::signal_only())
        .input("value", InputDef::new(PortType::fixed(Payload::Float)))
        .input(
            "trigger",
            InputDef::new(PortType::fixed(Payload::Float).unit(Unit::Norm01)).default_const(0.0),
        )
        .output(
            "out",
            OutputDef::new(PortType::fixed(Payload::Float).card(PortCard::Signal)),
        )
        .finish_with(finish_sample_hold)
}

fn sample_hold_state(ctx: &mut LowerCtx) -> Result<(crate::ir::StateIdx, CanonType), String> {
    let ty = ctx.out_type("out")?;
    let init = ConstVal::Float(ctx.cfg_f64_or("initialValue", 0.0));
    let key = StateKey::new(ctx.instance_key(), "sample");
    let state = ctx.ir.alloc_state(key, init, ty)?;
    Ok((state, ty))
}

fn lower_sample_hold(ctx: &mut LowerCtx) -> Result<Lowered, String> {
    let (state, ty) = sample_hold_state(ctx)?;
    let read = ctx.ir.state_read(state, ty);
    Ok(Lowered::new()
        .out("out", ValueRef::new(read, ty)?)
        .slot_request("out"))
}

fn finish_sample_hold(ctx: &mut LowerCtx) -> Result<(), String> {
    let (state, ty) = sample_hold_state(ctx)?;
    let prev = ctx.ir.state_read(state, ty);
    let value = ctx.require_input("value")?.id();
    let trigger = ctx.require_input("trigger")?.id();
    let next = ctx
        .ir
        .zip(vec![prev, value, trigger], KernelRef::Op(OpCode::Lerp), ty);
    ctx.ir.step_state_write(state, next);
    Ok(())
}

fn def_event_to_signal_mask() -> BlockDef {
    BlockDef::new("EventToSignalMask", lower_event_to_signal_mask)
        .label("Event mask")
        .category("event")
        .description("1 on ticks where the event fired, else 0.")
        .input("event", InputDef::new(PortType::event()))
        .output(
            "mask",
            OutputDef::new(
                PortType::fixed(Payload::Float)
                    .card(PortCard::Signal)
                    .contract(Contract::Clamp01),
            ),
        )
}

fn lower_event_to_signal_mask(ctx: &mut LowerCtx) -> Result<Lowered, String> {
    let event = ctx.require_input("event")?.clone();
    let ty = ctx.out_type("mask")?;
    let e = ctx
        .ir
        .map(event.id(), KernelRef::Named(KernelName::EventMask), ty);
    Ok(Lowered::new().out("mask", ValueRef::new(e, ty)?))
}

fn def_camera() -> BlockDef {
    BlockDef::new("Camera", lower_camera)
        .label("Camera")
        .category("render")
        .description("The single scene camera.")
        .capability(Capability::Render)
}

fn lower_camera(ctx: &mut LowerCtx) -> Result<Lowered, String> {
    if ctx.ir.has_camera() {
        return Err(String::from("duplicate camera declaration"));
    }
    let projection = match ctx.cfg_str("projection") {
        Some("orthographic") => CameraProjection::Orthographic,
        _ => CameraProjection::Perspective,
    };
    ctx.ir.add_render_global(RenderGlobal::Camera {
        projection,
        center: [
            ctx.cfg_f64_or("centerX", 0.0),
            ctx.cfg_f64_or("centerY", 0.0),
        ],
        distance: ctx.cfg_f64_or("distance", 10.0),
        tilt_deg: ctx.cfg_f64_or("tiltDeg", 0.0),
        yaw_deg: ctx.cfg_f64_or("yawDeg", 0.0),
        fov_y_deg: ctx.cfg_f64_or("fovYDeg", 60.0),
        near: ctx.cfg_f64_or("near", 0.1),
        far: ctx.cfg_f64_or("far", 100.0),
    });
    Ok(Lowered::new())
}

fn def_render_instances_2d() -> BlockDef {
    BlockDef::new("RenderInstances2D", lower_render_instances_2d)
        .label("Render instances")
        .category("render")
        .description("Draws one shape per lane of the position field.")
        .capability(Capability::Render)
        .cardinality(CardinalityInfo::field_only())
        .input(
            "pos",
            InputDef::new(PortType::fixed(Payload::Vec2).unit(Unit::Space(SpaceUnit::World))),
        )
        .input("color", InputDef::new(PortType::fixed(Payload::Color)))
        .input(
            "scale",
            InputDef::new(PortType::fixed(Payload::Float)).optional(),
        )
}

// Sink block: nothing downstream reads it, so it materializes its
// inputs itself through the imperative path.
fn lower_render_instances_2d(ctx: &mut LowerCtx) -> Result<Lowered, String> {
    let pos = ctx.require_input("pos")?.clone();
    let color = ctx.require_input("color")?.clone();
    let scale = ctx.input("scale").cloned();

    let (instance, _) = pos
        .ty()
        .instance()
        .ok_or_else(|| String::from("position must be a field"))?;

    let pos_slot = ctx.ir.alloc_slot(pos.ty())?;
    ctx.ir.step_eval(pos.id(), pos_slot);
    let color_slot = ctx.ir.alloc_slot(color.ty())?;
    ctx.ir.step_eval(color.id(), color_slot);
    let scale_slot = match &scale {
        Some(s) => {
            let slot = ctx.ir.alloc_slot(s.ty())?;
            ctx.ir.step_eval(s.id(), slot);
            Some(slot)
        }
        None => None,
    };

    // The shape is looked up from the instance, never wired here.
    let topology = ctx
        .ir
        .instance(instance)
        .and_then(|decl| decl.shape)
        .and_then(|sid| match ctx.ir.expr_at(sid) {
            ValueExpr::ShapeRef { topology, .. } => Some(*topology),
            _ => None,
        });

    ctx.ir.add_render_global(RenderGlobal::Instances2D {
        instance,
        pos: pos_slot,
        color: color_slot,
        scale: scale_slot,
        topology,
    });
    Ok(Lowered::new())
}

// ---------------------------------------------------------------------------
// Adapters
// ---------------------------------------------------------------------------

fn register_adapters(reg: &mut Registry) {
    use AngleUnit::*;
    use TimeUnit::*;
    let table: Vec<(&'static str, Unit, Unit)> = vec![
        ("AdaptTurnsToRadians", Unit::Angle(Turns), Unit::Angle(Radians)),
        ("AdaptRadiansToTurns", Unit::Angle(Radians), Unit::Angle(Turns)),
        ("AdaptDegreesToRadians", Unit::Angle(Degrees), Unit::Angle(Radians)),
        ("AdaptRadiansToDegrees", Unit::Angle(Radians), Unit::Angle(Degrees)),
        ("AdaptTurnsToDegrees", Unit::Angle(Turns), Unit::Angle(Degrees)),
        ("AdaptDegreesToTurns", Unit::Angle(Degrees), Unit::Angle(Turns)),
        ("AdaptMsToSeconds", Unit::Time(Ms), Unit::Time(Seconds)),
        ("AdaptSecondsToMs", Unit::Time(Seconds), Unit::Time(Ms)),
    ];
    for (name, from, to) in table {
        reg.register(
            BlockDef::new(name, lower_adapter)
                .category("adapter")
                .adapter(AdapterSpec { from, to })
                .input("in", InputDef::new(PortType::fixed(Payload::Float).unit(from)))
                .output("out", OutputDef::new(PortType::fixed(Payload::Float).unit(to))),
        )
        .expect("builtin adapter definition is valid");
    }
}

fn adapter_factor(block_type: &str) -> Result<f64, String> {
    use std::f64::consts::{PI, TAU};
    Ok(match block_type {
        "AdaptTurnsToRadians" => TAU,
        "AdaptRadiansToTurns" => 1.0 / TAU,
        "AdaptDegreesToRadians" => PI / 180.0,
        "AdaptRadiansToDegrees" => 180.0 / PI,
        "AdaptTurnsToDegrees" => 360.0,
        "AdaptDegreesToTurns" => 1.0 / 360.0,
        "AdaptMsToSeconds" => 0.001,
        "AdaptSecondsToMs" => 1000.0,
        other => return Err(format!("no adapter factor for {}", other)),
    })
}

fn lower_adapter(ctx: &mut LowerCtx) -> Result<Lowered, String> {
    let factor = adapter_factor(ctx.block_type)?;
    let src = ctx.require_input("in")?.clone();
    let out_ty = ctx.out_type("out")?;
    let c = ctx.ir.const_f64(factor, float_sig());
    let e = if src.is_field() {
        ctx.ir
            .zip_sig(src.id(), vec![c], KernelRef::Op(OpCode::Mul), out_ty)
    } else {
        ctx.ir
            .zip(vec![src.id(), c], KernelRef::Op(OpCode::Mul), out_ty)
    };
    Ok(Lowered::new().out("out", ValueRef::new(e, out_ty)?))
}

// ---------------------------------------------------------------------------
// Macros
// ---------------------------------------------------------------------------

fn def_oscillator() -> BlockDef {
    BlockDef::new("Oscillator", lower_never)
        .label("Oscillator")
        .category("source")
        .description("sin(t * frequency), prewired.")
        .output("out", OutputDef::new(PortType::fixed(Payload::Float)))
        .macro_form(expand_oscillator)
}

fn lower_never(_: &mut LowerCtx) -> Result<Lowered, String> {
    Err(String::from("macro blocks are expanded before lowering"))
}

fn expand_oscillator(config: &Config) -> Result<Expansion, String> {
    let frequency = crate::registry::cfg_f64_or(config, "frequency", 1.0);
    let mut freq_cfg = Config::new();
    freq_cfg.insert(String::from("value"), serde_json::json!(frequency));
    let mut expr_cfg = Config::new();
    expr_cfg.insert(
        String::from("expression"),
        serde_json::json!("sin(in0 * in1 * tau)"),
    );
    Ok(Expansion {
        blocks: vec![
            (String::from("time"), "Time", Config::new()),
            (String::from("freq"), "Const", freq_cfg),
            (String::from("expr"), "Expression", expr_cfg),
        ],
        edges: vec![
            (String::from("time:t"), String::from("expr:in0")),
            (String::from("freq:out"), String::from("expr:in1")),
        ],
        inputs: Vec::new(),
        outputs: vec![("out", String::from("expr:out"))],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_register_cleanly() {
        let reg = Registry::builtins();
        for ty in &[
            "Const",
            "Time",
            "ExternalGate",
            "Expression",
            "Sin",
            "SampleHold",
            "ProceduralPolygon",
            "RenderInstances2D",
            "Oscillator",
        ] {
            assert!(reg.get(ty).is_some(), "missing builtin {}", ty);
        }
        assert!(reg.types_in_category("adapter").len() >= 8);
        assert!(reg
            .find_adapter(Unit::Angle(AngleUnit::Turns), Unit::Angle(AngleUnit::Radians))
            .is_some());
        assert!(reg
            .find_adapter(Unit::Time(TimeUnit::Seconds), Unit::Angle(AngleUnit::Radians))
            .is_none());
    }

    #[test]
    fn test_const_from_config_payloads() {
        let mut cfg = Config::new();
        cfg.insert(String::from("value"), serde_json::json!(2.5));
        assert_eq!(
            const_from_config(&cfg, Payload::Float).unwrap(),
            ConstVal::Float(2.5)
        );
        assert_eq!(
            const_from_config(&cfg, Payload::Int).unwrap(),
            ConstVal::Int(2)
        );
        assert_eq!(
            const_from_config(&cfg, Payload::Bool).unwrap(),
            ConstVal::Bool(true)
        );

        cfg.insert(String::from("value"), serde_json::json!([1.0, 2.0]));
        assert_eq!(
            const_from_config(&cfg, Payload::Vec2).unwrap(),
            ConstVal::Vec2([1.0, 2.0])
        );
        assert!(const_from_config(&cfg, Payload::Vec3).is_err());
        assert!(const_from_config(&cfg, Payload::Shape).is_err());

        // Missing value defaults to zero.
        assert_eq!(
            const_from_config(&Config::new(), Payload::Float).unwrap(),
            ConstVal::Float(0.0)
        );
    }

    #[test]
    fn test_adapter_factors_invert() {
        let pairs = [
            ("AdaptTurnsToRadians", "AdaptRadiansToTurns"),
            ("AdaptDegreesToRadians", "AdaptRadiansToDegrees"),
            ("AdaptTurnsToDegrees", "AdaptDegreesToTurns"),
            ("AdaptMsToSeconds", "AdaptSecondsToMs"),
        ];
        for (there, back) in &pairs {
            let product = adapter_factor(there).unwrap() * adapter_factor(back).unwrap();
            assert!((product - 1.0).abs() < 1e-12, "{} / {}", there, back);
        }
        assert!(adapter_factor("AdaptNothing").is_err());
    }

    #[test]
    fn test_expression_function_table() {
        assert_eq!(function_of("sin").unwrap(), OpCode::Sin);
        assert_eq!(function_of("lerp").unwrap(), OpCode::Lerp);
        assert_eq!(function_of("lerp").unwrap().arity(), 3);
        assert!(function_of("sinh").is_err());
    }

    #[test]
    fn test_oscillator_expansion_shape() {
        let mut cfg = Config::new();
        cfg.insert(String::from("frequency"), serde_json::json!(3.0));
        let exp = expand_oscillator(&cfg).unwrap();
        assert_eq!(exp.blocks.len(), 3);
        assert_eq!(exp.edges.len(), 2);
        assert_eq!(exp.outputs, vec![("out", String::from("expr:out"))]);
        let freq = exp
            .blocks
            .iter()
            .find(|(suffix, _, _)| suffix == "freq")
            .unwrap();
        assert_eq!(freq.1, "Const");
        assert_eq!(freq.2.get("value"), Some(&serde_json::json!(3.0)));
    }
}
