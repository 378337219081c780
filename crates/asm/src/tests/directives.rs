use super::*;

use a65_obj::ExprKind;

#[test]
fn byte_accepts_values_and_strings() {
    let module = assemble(".byte 1, 2, \"AB\", $FF");
    assert_eq!(module.chunks[0].data, vec![0x01, 0x02, 0x41, 0x42, 0xFF]);
}

#[test]
fn word_emits_little_endian() {
    let module = assemble(
        "
        foo = $8000
        .word $1234, foo
        ",
    );
    assert_eq!(module.chunks[0].data, vec![0x34, 0x12, 0x00, 0x80]);
}

#[test]
fn word_with_forward_reference_defers() {
    let module = assemble(
        "
        .word foo
        foo = $1234
        ",
    );
    let chunk = &module.chunks[0];
    assert_eq!(chunk.data, vec![0x00, 0x00]);
    assert_eq!(chunk.subs.len(), 1);
    assert_eq!(chunk.subs[0].size, 2);
    assert_eq!(module.patched_data(chunk), vec![0x34, 0x12]);
}

#[test]
fn res_reserves_with_fill_value() {
    let module = assemble(".res 3, $AA");
    assert_eq!(module.chunks[0].data, vec![0xAA, 0xAA, 0xAA]);

    let module = assemble(".res 2");
    assert_eq!(module.chunks[0].data, vec![0x00, 0x00]);
}

#[test]
fn res_requires_a_constant() {
    let err = assemble_err(".res foo");
    assert!(err.contains("Expression is not constant"), "{err}");
}

#[test]
fn bytestr_decodes_base64() {
    let module = assemble(".bytestr \"SGk=\"");
    assert_eq!(module.chunks[0].data, vec![0x48, 0x69]);

    let err = assemble_err(".bytestr \"not base64!\"");
    assert!(err.contains("Bad base64 string"), "{err}");
}

#[test]
fn org_reuses_chunk_at_its_end() {
    let module = assemble(
        "
        .org $8000
        lda #1
        .org $8002
        lda #2
        ",
    );
    assert_eq!(module.chunks.len(), 1);
    assert_eq!(module.chunks[0].data, vec![0xA9, 0x01, 0xA9, 0x02]);
}

#[test]
fn org_elsewhere_opens_a_new_chunk() {
    let module = assemble(
        "
        .org $8000
        lda #1
        .org $9000
        lda #2
        ",
    );
    assert_eq!(module.chunks.len(), 2);
    assert_eq!(module.chunks[0].org, Some(0x8000));
    assert_eq!(module.chunks[1].org, Some(0x9000));
}

#[test]
fn reloc_clears_the_origin() {
    let module = assemble(
        "
        .org $8000
        lda #1
        .reloc
        lda #2
        ",
    );
    assert_eq!(module.chunks.len(), 2);
    assert_eq!(module.chunks[1].org, None);
}

#[test]
fn label_names_an_empty_chunk() {
    let module = assemble(
        "
        start:
        lda #1
        middle:
        lda #2
        ",
    );
    assert_eq!(module.chunks[0].name.as_deref(), Some("start"));
}

#[test]
fn assert_failures_and_deferral() {
    let module = assemble(".assert 2 = 2");
    assert!(module.chunks.is_empty());

    let err = assemble_err(".assert 1 = 2, error, \"boom\"");
    assert_eq!(err, "boom");

    let err = assemble_err(".assert 1 = 2");
    assert_eq!(err, "Assertion failed");

    let module = assemble(
        "
        .reloc
        foo:
        .assert foo = 5
        ",
    );
    assert_eq!(module.chunks[0].asserts.len(), 1);
}

#[test]
fn assert_warning_goes_to_the_sink() {
    let sink = SharedSink::default();
    let (_, warnings) = sink.handles();

    let mut asm = Assembler::default();
    asm.set_sink(Box::new(sink));
    let mut source = VecSource::new(lines(".assert 1 = 2, warning, \"close one\""));
    asm.assemble(&mut source).expect("assemble");
    asm.module().expect("module");

    assert_eq!(warnings.borrow().as_slice(), ["close one".to_string()]);
}

#[test]
fn out_warning_and_error() {
    let sink = SharedSink::default();
    let (out, warnings) = sink.handles();

    let mut asm = Assembler::default();
    asm.set_sink(Box::new(sink));
    let mut source = VecSource::new(lines(
        "
        .out \"hello\"
        .warning \"careful\"
        ",
    ));
    asm.assemble(&mut source).expect("assemble");
    assert_eq!(out.borrow().as_slice(), ["hello".to_string()]);
    assert_eq!(warnings.borrow().as_slice(), ["careful".to_string()]);

    let err = assemble_err(".error \"fatal\"");
    assert_eq!(err, "fatal");
}

#[test]
fn move_records_an_opaque_substitution() {
    let module = assemble(".move 3, $8000");
    let chunk = &module.chunks[0];
    assert_eq!(chunk.data, vec![0x00, 0x00, 0x00]);
    assert_eq!(chunk.subs.len(), 1);
    assert_eq!(chunk.subs[0].size, 3);
    assert!(matches!(chunk.subs[0].expr.kind, ExprKind::Move(_)));
}

#[test]
fn unknown_directive() {
    let err = assemble_err(".frobnicate 1");
    assert!(err.contains("Unknown directive .frobnicate"), "{err}");
}
