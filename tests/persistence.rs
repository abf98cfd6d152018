use std::process::ExitCode;

use clap::Parser;
use image::{Rgba, RgbaImage};
use kurbo::{Point, Size};
use layercraft::{
    ExportFormat, FlipAxis, LayerStack, RenderOptions, RenderSize, StackSnapshot, TiffCompression, TiledImage,
    cli::{self, CliArgs},
    io, render,
};

fn gradient(w: u32, h: u32) -> RgbaImage {
    RgbaImage::from_fn(w, h, |x, y| Rgba([(x * 3) as u8, (y * 5) as u8, 128, 255]))
}

fn sample_stack() -> LayerStack {
    let mut s = LayerStack::new(Size::new(80.0, 60.0)).unwrap();
    let bg = s
        .add_named_layer("paper".into(), TiledImage::from_rgba_image(&gradient(80, 60)).unwrap(), None)
        .unwrap();
    let sticker = s
        .add_named_layer(
            "sticker".into(),
            TiledImage::new_filled(70, 70, Rgba([10, 200, 30, 180])).unwrap(),
            Some(Point::new(12.0, -7.5)),
        )
        .unwrap();
    s.set_rotation(sticker, 0.6).unwrap();
    s.flip(sticker, FlipAxis::VisualHorizontal).unwrap();
    s.set_active_layer(Some(sticker)).unwrap();
    s.toggle_visibility(bg).unwrap();
    s
}

#[test]
fn project_file_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("card.lcp");
    let stack = sample_stack();

    io::save_project(&stack, &path).unwrap();
    let loaded = io::load_project(&path).unwrap();

    assert_eq!(StackSnapshot::capture(&loaded), StackSnapshot::capture(&stack));
    let names: Vec<&str> = loaded.layers().map(|l| l.name.as_str()).collect();
    assert_eq!(names, vec!["paper", "sticker"]);
}

#[test]
fn corrupt_project_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.lcp");
    let mut bytes = io::project_to_bytes(&sample_stack()).unwrap();
    bytes.truncate(bytes.len() / 2);
    std::fs::write(&path, &bytes).unwrap();
    assert!(io::load_project(&path).is_err());

    std::fs::write(&path, b"definitely not a project").unwrap();
    assert!(io::load_project(&path).is_err());
}

#[test]
fn every_format_writes_a_decodable_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut stack = LayerStack::new(Size::new(40.0, 30.0)).unwrap();
    stack
        .add_layer(TiledImage::from_rgba_image(&gradient(40, 30)).unwrap(), None)
        .unwrap();

    let formats = [
        ExportFormat::Png,
        ExportFormat::Jpeg { quality: 90 },
        ExportFormat::Bmp,
        ExportFormat::Tga,
        ExportFormat::Tiff(TiffCompression::None),
        ExportFormat::Tiff(TiffCompression::Lzw),
        ExportFormat::Tiff(TiffCompression::Deflate),
    ];
    for (i, format) in formats.into_iter().enumerate() {
        let encoded = render(&stack, RenderSize::Half, format, RenderOptions::default()).unwrap();
        assert_eq!((encoded.width, encoded.height), (20, 15));
        let path = dir.path().join(format!("out{i}.{}", encoded.extension()));
        encoded.write_to(&path).unwrap();
        let back = image::open(&path).unwrap();
        assert_eq!((back.width(), back.height()), (20, 15), "{}", format.name());
    }
}

#[test]
fn imported_image_keeps_its_pixels() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("src.png");
    let src = gradient(70, 65);
    src.save(&path).unwrap();
    let tiled = io::import_image(&path).unwrap();
    assert_eq!(tiled.to_rgba_image(), src);
}

fn args(list: &[&str]) -> CliArgs {
    CliArgs::try_parse_from(std::iter::once("LayerCraft").chain(list.iter().copied())).unwrap()
}

#[test]
fn cli_stacks_inputs_and_erases_with_the_wand() {
    let dir = tempfile::tempdir().unwrap();
    let bottom = dir.path().join("bottom.png");
    let top = dir.path().join("top.png");
    let out = dir.path().join("result.png");
    let project = dir.path().join("result.lcp");

    RgbaImage::from_pixel(16, 16, Rgba([0, 0, 255, 255])).save(&bottom).unwrap();
    let mut sticker = RgbaImage::from_pixel(16, 16, Rgba([255, 255, 255, 255]));
    for y in 4..12 {
        for x in 4..12 {
            sticker.put_pixel(x, y, Rgba([200, 0, 0, 255]));
        }
    }
    sticker.save(&top).unwrap();

    let code = cli::run(args(&[
        "-i",
        bottom.to_str().unwrap(),
        top.to_str().unwrap(),
        "--wand",
        "0,0",
        "--tolerance",
        "0",
        "-o",
        out.to_str().unwrap(),
        "--save-project",
        project.to_str().unwrap(),
    ]));
    assert_eq!(code, ExitCode::SUCCESS);

    // the white border of the top layer is gone, the blue layer shows through
    let rendered = image::open(&out).unwrap().to_rgba8();
    assert_eq!(rendered.dimensions(), (16, 16));
    assert_eq!(rendered.get_pixel(0, 0).0, [0, 0, 255, 255]);
    assert_eq!(rendered.get_pixel(8, 8).0, [200, 0, 0, 255]);

    let reloaded = io::load_project(&project).unwrap();
    assert_eq!(reloaded.len(), 2);
}

#[test]
fn cli_jpeg_without_alpha_decision_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("half.png");
    let out = dir.path().join("half.jpg");
    RgbaImage::from_pixel(8, 8, Rgba([1, 2, 3, 100])).save(&input).unwrap();

    let failed = cli::run(args(&["-i", input.to_str().unwrap(), "-o", out.to_str().unwrap()]));
    assert_eq!(failed, ExitCode::FAILURE);
    assert!(!out.exists());

    let ok = cli::run(args(&[
        "-i",
        input.to_str().unwrap(),
        "-o",
        out.to_str().unwrap(),
        "--flatten-onto",
        "#ffffff",
    ]));
    assert_eq!(ok, ExitCode::SUCCESS);
    assert!(out.exists());
}

#[test]
fn cli_needs_something_to_do() {
    let code = cli::run(args(&["-i", "no/such/*.png", "-o", "x.png"]));
    assert_eq!(code, ExitCode::FAILURE);
}
