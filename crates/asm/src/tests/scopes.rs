use super::*;

#[test]
fn reference_promotes_to_the_outer_definition() {
    let module = assemble(
        "
        .scope A
        lda foo
        .endscope
        foo = $42
        ",
    );
    let chunk = &module.chunks[0];
    assert_eq!(chunk.data, vec![0xAD, 0x00, 0x00]);
    assert_eq!(chunk.subs.len(), 1);
    assert_eq!(module.resolve(&chunk.subs[0].expr), Some(0x42));
    assert_eq!(module.patched_data(chunk), vec![0xAD, 0x42, 0x00]);

    // Exactly one symbol carries the constant; the scope-local one aliases it.
    let constants: Vec<i64> = module
        .symbols
        .iter()
        .filter_map(|symbol| symbol.expr.const_value())
        .collect();
    assert_eq!(constants, vec![0x42]);
}

#[test]
fn promotion_cascades_through_nested_scopes() {
    // The reference in B aliases into A during the post-order sweep, then
    // A's sweep points the same record at the root definition.
    let module = assemble(
        "
        .scope A
        .scope B
        lda foo
        .endscope
        .endscope
        foo = $42
        ",
    );
    assert_eq!(module.resolve(&module.chunks[0].subs[0].expr), Some(0x42));
}

#[test]
fn inner_definitions_shadow_outer_ones() {
    let module = assemble(
        "
        foo = 1
        .scope A
        foo = 2
        .byte foo
        .endscope
        .byte foo
        ",
    );
    assert_eq!(module.chunks[0].data, vec![0x02, 0x01]);
}

#[test]
fn explicit_paths_reach_into_scopes() {
    let module = assemble(
        "
        .scope outer
        .scope inner
        foo = 1
        .endscope
        bar = inner::foo + 1
        .endscope
        baz = outer::inner::foo + 2
        quux = ::outer::bar
        ",
    );
    let constants: Vec<i64> = module
        .symbols
        .iter()
        .filter_map(|symbol| symbol.expr.const_value())
        .collect();
    assert!(constants.contains(&2), "{constants:?}");
    assert!(constants.contains(&3), "{constants:?}");
}

#[test]
fn first_path_segment_falls_back_to_the_parent() {
    let module = assemble(
        "
        .scope A
        foo = 7
        bar = A::foo
        .endscope
        ",
    );
    let sevens = module
        .symbols
        .iter()
        .filter(|symbol| symbol.expr.const_value() == Some(7))
        .count();
    assert_eq!(sevens, 2);
}

#[test]
fn unknown_scope_path() {
    let err = assemble_err("x = nope::y");
    assert!(err.contains("Could not resolve scope 'nope'"), "{err}");
}

#[test]
fn explicitly_scoped_references_are_not_promoted() {
    let err = assemble_err(
        "
        .scope B
        .endscope
        .scope A
        lda B::x
        .endscope
        ",
    );
    assert!(err.contains("Symbol 'x' undefined"), "{err}");
}

#[test]
fn reentering_a_scope_is_an_error_by_default() {
    let err = assemble_err(
        "
        .scope A
        .endscope
        .scope A
        .endscope
        ",
    );
    assert!(err.contains("Cannot re-enter scope 'A'"), "{err}");
}

#[test]
fn reentrant_scopes_option() {
    let options = AssemblerOptions {
        reentrant_scopes: true,
        ..AssemblerOptions::default()
    };
    let module = assemble_with(
        options,
        "
        .scope A
        foo = 1
        .endscope
        .scope A
        bar = foo + 1
        .endscope
        ",
    );
    let constants: Vec<i64> = module
        .symbols
        .iter()
        .filter_map(|symbol| symbol.expr.const_value())
        .collect();
    assert_eq!(constants, vec![1, 2]);
}

#[test]
fn proc_binds_its_name_as_a_label() {
    let module = assemble(
        "
        .org $8000
        .proc main
        rts
        .endproc
        jsr main
        ",
    );
    assert_eq!(module.chunks[0].data, vec![0x60, 0x20, 0x00, 0x80]);
}

#[test]
fn scope_close_mismatches() {
    let err = assemble_err(".endscope");
    assert!(err.contains(".endscope without .scope"), "{err}");

    let err = assemble_err(
        "
        .scope A
        .endproc
        ",
    );
    assert!(err.contains(".endproc without .proc"), "{err}");
}

#[test]
fn unclosed_scope() {
    let err = assemble_err(".scope A");
    assert!(err.contains("Scope never closed"), "{err}");
}

#[test]
fn cheap_locals_live_between_labels() {
    let module = assemble(
        "
        .org $8000
        first:
        ldx #4
        @loop:
        dex
        bne @loop
        second:
        ldy #2
        @loop:
        dey
        bne @loop
        ",
    );
    // Both regions reuse `@loop` without clashing.
    assert_eq!(
        module.chunks[0].data,
        vec![0xA2, 0x04, 0xCA, 0xD0, 0xFD, 0xA0, 0x02, 0x88, 0xD0, 0xFD]
    );
}

#[test]
fn undefined_cheap_local_is_caught_at_the_next_label() {
    let err = assemble_err(
        "
        start:
        bne @oops
        done:
        ",
    );
    assert!(err.contains("Cheap local label '@oops' never defined"), "{err}");
}

#[test]
fn undefined_cheap_local_is_caught_at_finalization() {
    let err = assemble_err("bne @oops");
    assert!(err.contains("Cheap local label '@oops' never defined"), "{err}");
}

#[test]
fn cheap_locals_cannot_be_assigned() {
    let err = assemble_err("@x = 1");
    assert!(err.contains("Cheap locals may only be labels"), "{err}");
}

#[test]
fn redefining_a_cheap_label() {
    let err = assemble_err(
        "
        @x:
        @x:
        ",
    );
    assert!(err.contains("Redefining symbol '@x'"), "{err}");
}

#[test]
fn anonymous_labels() {
    let module = assemble(
        "
        .reloc
        :
        lda #1
        bne :-
        :
        lda #2
        bne :+
        :
        lda #3
        ",
    );
    let chunk = &module.chunks[0];
    assert_eq!(chunk.data.len(), 10);
    // The backward reference is a fixed distance within the chunk; the
    // forward one waits for the linker.
    assert_eq!(chunk.data[3], 0xFC);
    assert_eq!(chunk.subs.len(), 1);
    assert_eq!(chunk.subs[0].offset, 7);

    let target = &module.symbols[0].expr;
    assert!(target.meta.rel);
    assert_eq!(target.kind, a65_obj::ExprKind::Num(8));
}

#[test]
fn anonymous_refs_by_count_and_number() {
    let module = assemble(
        "
        .org $8000
        :
        nop
        :
        nop
        jmp :--
        jmp :-1
        ",
    );
    // `:--` reaches the first anon label, `:-1` the nearest.
    assert_eq!(
        module.chunks[0].data,
        vec![0xEA, 0xEA, 0x4C, 0x00, 0x80, 0x4C, 0x01, 0x80]
    );
}

#[test]
fn bad_anonymous_backref() {
    let err = assemble_err("bne :-");
    assert!(err.contains("Bad anonymous backref"), "{err}");
}

#[test]
fn dangling_anonymous_forward_reference() {
    let err = assemble_err("bne :+");
    assert!(err.contains("Anonymous forward reference never defined"), "{err}");
}

#[test]
fn relative_labels() {
    let module = assemble(
        "
        .org $8000
        -:
        nop
        beq -
        beq +
        nop
        +:
        rts
        ",
    );
    assert_eq!(
        module.patched_data(&module.chunks[0]),
        vec![0xEA, 0xF0, 0xFD, 0xF0, 0x01, 0xEA, 0x60]
    );
}

#[test]
fn relative_distance_is_tagged_by_repetition() {
    let module = assemble(
        "
        .org $8000
        beq ++
        nop
        +:
        nop
        ++:
        rts
        ",
    );
    // `++` skips the single-`+` label.
    assert_eq!(
        module.patched_data(&module.chunks[0]),
        vec![0xF0, 0x02, 0xEA, 0xEA, 0x60]
    );
}

#[test]
fn bad_relative_backref() {
    let err = assemble_err("bne -");
    assert!(err.contains("Bad relative backref"), "{err}");
}
