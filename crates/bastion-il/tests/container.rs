use bastion_il::{
    decode, encode, BodyBuilder, DecodeError, HandlerKind, MemberRef, Op, Program,
    ProgramBuilder, TypeKind, TypeSig,
};

/// A program touching most of the container: structs, inheritance, statics, member refs,
/// switches and nested handlers.
fn sample() -> Program {
    let mut b = ProgramBuilder::new("container-sample");
    let point = b.add_type("Demo", "Point", TypeKind::Struct);
    let x = b.add_field(point, "X", TypeSig::I32, false);
    b.add_field(point, "Y", TypeSig::I32, false);

    let shape = b.add_type("Demo", "Shape", TypeKind::Class);
    b.type_mut(shape).base = Some(TypeSig::Object);
    let origin = b.add_field(shape, "Origin", TypeSig::Def(point), false);
    let count = b.add_field(shape, "Count", TypeSig::I64, true);

    let concat = b.member(MemberRef::method(
        TypeSig::String,
        "Concat",
        true,
        vec![TypeSig::String, TypeSig::String],
        TypeSig::String,
    ));

    let main = b.declare_method(shape, "Main", true, vec![TypeSig::I32], TypeSig::String);
    let mut body = BodyBuilder::new(vec![TypeSig::Def(point), TypeSig::String]);
    let (zero, one, done) = (body.label(), body.label(), body.label());
    let (ts, fs, hs, end) = (body.label(), body.label(), body.label(), body.label());
    body.op(Op::Ldarg(0)).switch(vec![zero, one]);
    body.op(Op::LdStr("many".into())).op(Op::Stloc(1)).branch(Op::Br, done);
    body.mark(zero).op(Op::LdStr("zero".into())).op(Op::Stloc(1)).branch(Op::Br, done);
    body.mark(one).op(Op::LdStr("one".into())).op(Op::Stloc(1));
    body.mark(done).mark(ts).ops([
        Op::Ldloca(0),
        Op::LdcI4(3),
        Op::Stfld(x),
        Op::Ldsfld(count),
        Op::LdcI8(1),
        Op::Add,
        Op::Stsfld(count),
        Op::LdNull,
        Op::Ldflda(origin),
        Op::Pop,
    ]);
    body.branch(Op::Leave, end);
    body.mark(fs).op(Op::Endfinally);
    body.mark(hs).op(Op::Pop).branch(Op::Leave, end);
    body.mark(end).ops([Op::Ldloc(1), Op::LdStr("!".into()), Op::Call(concat), Op::Ret]);
    body.handler(HandlerKind::Finally, ts, fs, fs, hs);
    body.handler(HandlerKind::Catch(Some(TypeSig::Object)), ts, hs, hs, end);
    b.set_body(main, body.finish().expect("body"));
    b.set_entry(main);
    b.build()
}

#[test]
fn json_form_and_container_agree() {
    let program = sample();
    let json = serde_json::to_string_pretty(&program).expect("to json");
    let from_json: Program = serde_json::from_str(&json).expect("from json");
    assert_eq!(from_json, program);

    let bytes = encode(&from_json);
    let decoded = decode(&bytes).expect("decode");
    assert_eq!(decoded, program);
    assert_eq!(encode(&decoded), bytes);
}

#[test]
fn every_truncation_is_rejected() {
    let bytes = encode(&sample());
    for len in 0..bytes.len() {
        assert!(decode(&bytes[..len]).is_err(), "prefix of {len} bytes decoded");
    }
}

#[test]
fn future_format_versions_are_rejected() {
    let mut bytes = encode(&sample());
    bytes[4] = bytes[4].wrapping_add(1);
    assert!(matches!(decode(&bytes), Err(DecodeError::UnsupportedVersion(_))));
}
