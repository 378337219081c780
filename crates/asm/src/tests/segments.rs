use super::*;

use a65_obj::OverwriteMode;

#[test]
fn segment_switch_opens_new_chunks() {
    let module = assemble(
        "
        .segment \"A\"
        lda #1
        .segment \"B\"
        lda #2
        ",
    );
    assert_eq!(module.chunks.len(), 2);
    assert_eq!(module.chunks[0].segments, vec!["A".to_string()]);
    assert_eq!(module.chunks[1].segments, vec!["B".to_string()]);
}

#[test]
fn segment_attributes_build_descriptors() {
    let module = assemble(
        "
        .segment \"CODE\" mem $8000 size $4000 off 0, \"DATA\" zp
        ",
    );
    let code = module
        .segments
        .iter()
        .find(|s| s.name == "CODE")
        .expect("CODE descriptor");
    assert_eq!(code.memory, Some(0x8000));
    assert_eq!(code.size, Some(0x4000));
    assert_eq!(code.offset, Some(0));

    let data = module
        .segments
        .iter()
        .find(|s| s.name == "DATA")
        .expect("DATA descriptor");
    assert_eq!(data.addressing, a65_obj::Addressing::ZeroPage);
}

#[test]
fn sized_segment_without_offset_takes_the_file_cursor() {
    let module = assemble(
        "
        .segment \"A\" size $100
        .segment \"B\" size $200
        ",
    );
    let a = module.segments.iter().find(|s| s.name == "A").expect("A");
    let b = module.segments.iter().find(|s| s.name == "B").expect("B");
    assert_eq!(a.offset, Some(0));
    assert_eq!(b.offset, Some(0x100));
}

#[test]
fn fill_installs_a_default_free_range() {
    let module = assemble(".segment \"RAM\" mem $0200 size $100 fill 0");
    let ram = module.segments.iter().find(|s| s.name == "RAM").expect("RAM");
    assert_eq!(ram.free.iter().collect::<Vec<_>>(), vec![(0x0200, 0x0300)]);
}

#[test]
fn pushseg_popseg_restores_segments_and_chunk() {
    let module = assemble(
        "
        .segment \"A\"
        lda #1
        .pushseg \"B\"
        lda #2
        .popseg
        lda #3
        ",
    );
    assert_eq!(module.chunks.len(), 2);
    // The pop returns to the very chunk that was active, so the third
    // instruction appends to it.
    assert_eq!(module.chunks[0].segments, vec!["A".to_string()]);
    assert_eq!(module.chunks[0].data, vec![0xA9, 0x01, 0xA9, 0x03]);
    assert_eq!(module.chunks[1].segments, vec!["B".to_string()]);
    assert_eq!(module.chunks[1].data, vec![0xA9, 0x02]);
}

#[test]
fn popseg_without_pushseg() {
    let err = assemble_err(".popseg");
    assert!(err.contains(".popseg without .pushseg"), "{err}");
}

#[test]
fn segment_prefix_applies_to_literals() {
    let module = assemble(
        "
        .segmentprefix \"bank1_\"
        .segment \"code\"
        lda #1
        ",
    );
    assert_eq!(module.chunks[0].segments, vec!["bank1_code".to_string()]);
}

#[test]
fn free_reserves_a_range_and_advances_the_origin() {
    let module = assemble(
        "
        .segment \"CODE\" mem $8000 size $4000 off 0
        .org $8000
        .res 16
        .free $100
        lda #1
        ",
    );
    let code = module
        .segments
        .iter()
        .find(|s| s.name == "CODE")
        .expect("CODE descriptor");
    assert_eq!(code.free.iter().collect::<Vec<_>>(), vec![(0x8010, 0x8110)]);
    assert_eq!(module.chunks.len(), 2);
    assert_eq!(module.chunks[1].org, Some(0x8110));
}

#[test]
fn free_without_an_origin() {
    let err = assemble_err(
        "
        .reloc
        .free $10
        ",
    );
    assert!(err.contains(".free in .reloc mode"), "{err}");
}

#[test]
fn free_needs_a_containing_segment() {
    let err = assemble_err(
        "
        .segment \"CODE\" mem $8000 size $100 off 0
        .org $C000
        .free $10
        ",
    );
    assert!(err.contains("single containing segment"), "{err}");
}

#[test]
fn overwrite_forbid_rejects_duplicate_writes() {
    let options = AssemblerOptions {
        overwrite_mode: OverwriteMode::Forbid,
        ..AssemblerOptions::default()
    };
    let err = assemble_err_with(
        options,
        "
        .segment \"CODE\" mem $8000 size $100 off 0
        .org $8000
        .byte 1
        .org $8000
        .byte 2
        ",
    );
    assert!(err.contains("Overlapping write"), "{err}");
}

#[test]
fn overwrite_warn_reports_but_continues() {
    let options = AssemblerOptions {
        overwrite_mode: OverwriteMode::Warn,
        ..AssemblerOptions::default()
    };
    let sink = SharedSink::default();
    let (_, warnings) = sink.handles();

    let mut asm = Assembler::with_options(a65_isa6502::Cpu::mos6502(), options);
    asm.set_sink(Box::new(sink));
    let mut source = VecSource::new(lines(
        "
        .segment \"CODE\" mem $8000 size $100 off 0
        .org $8000
        .byte 1
        .org $8000
        .byte 2
        ",
    ));
    asm.assemble(&mut source).expect("assemble");
    asm.module().expect("module");
    assert_eq!(warnings.borrow().len(), 1);
}

#[test]
fn overwrite_allow_is_silent() {
    let module = assemble(
        "
        .segment \"CODE\" mem $8000 size $100 off 0
        .org $8000
        .byte 1
        .org $8000
        .byte 2
        ",
    );
    assert_eq!(module.chunks.len(), 2);
}

#[test]
fn unmapped_origins_skip_write_tracking() {
    // No segment maps these addresses to file offsets, so duplicate writes
    // cannot be detected and are accepted even under `forbid`.
    let options = AssemblerOptions {
        overwrite_mode: OverwriteMode::Forbid,
        ..AssemblerOptions::default()
    };
    let module = assemble_with(
        options,
        "
        .org $8000
        .byte 1
        .org $8000
        .byte 2
        ",
    );
    assert_eq!(module.chunks.len(), 2);
}

#[test]
fn freed_ranges_count_as_written() {
    let options = AssemblerOptions {
        overwrite_mode: OverwriteMode::Forbid,
        ..AssemblerOptions::default()
    };
    let err = assemble_err_with(
        options,
        "
        .segment \"CODE\" mem $8000 size $4000 off 0
        .org $8000
        .free $10
        .org $8008
        .byte 1
        ",
    );
    assert!(err.contains("Overlapping write"), "{err}");
}
