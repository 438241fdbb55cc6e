use glam::{Mat4, Vec3};
use wgpu_scene::asset::{Geometry, Handle, Material};
use wgpu_scene::renderer::{DeviceCommand, GraphicsDevice, ProgramId, RecordingDevice, Viewport};
use wgpu_scene::scene::{
    Camera, DrawableKind, Fog, InstanceMatrices, Light, Plane, Renderable, Transform,
};
use wgpu_scene::settings::ShadowMapSettings;
use wgpu_scene::{RenderError, RenderSettings, Renderer, Scene};

struct Fixture {
    scene: Scene,
    camera: Camera,
    cube: Handle<Geometry>,
    opaque: Handle<Material>,
    glass: Handle<Material>,
}

/// One shadow casting directional light, one opaque and one transparent cube.
fn shadow_scene() -> Fixture {
    let mut scene = Scene::new();
    let cube = scene.assets.geometries.insert(Geometry::cuboid(1.0, 1.0, 1.0));
    let opaque = scene
        .assets
        .materials
        .insert(Material::standard(Vec3::new(0.8, 0.2, 0.2)));
    let glass = scene
        .assets
        .materials
        .insert(Material::basic(Vec3::ONE).with_transparency(0.5));

    scene
        .entity()
        .with_transform(Transform::from_translation(Vec3::new(-1.0, 0.0, 0.0)))
        .with_renderable(Renderable {
            cast_shadow: true,
            receive_shadow: true,
            ..Renderable::mesh(cube, opaque)
        })
        .spawn();
    scene
        .entity()
        .with_transform(Transform::from_translation(Vec3::new(1.0, 0.0, 0.0)))
        .with_renderable(Renderable::mesh(cube, glass))
        .spawn();
    scene
        .entity()
        .with_transform(Transform::from_translation(Vec3::new(5.0, 10.0, 5.0)))
        .with_light(Light::directional(Vec3::ONE, 1.0).with_shadow())
        .spawn();

    let camera = Camera::perspective(60f32.to_radians(), 4.0 / 3.0, 0.1, 100.0)
        .looking_at(Vec3::new(0.0, 2.0, 8.0), Vec3::ZERO);

    Fixture {
        scene,
        camera,
        cube,
        opaque,
        glass,
    }
}

fn shadow_settings() -> RenderSettings {
    RenderSettings {
        shadow_map: ShadowMapSettings {
            enabled: true,
            ..ShadowMapSettings::default()
        },
        ..RenderSettings::default()
    }
}

fn renderer(settings: RenderSettings) -> Renderer<RecordingDevice> {
    let mut renderer = Renderer::new(RecordingDevice::new(), settings);
    renderer.set_size(640, 480);
    renderer
}

/// Index of the command that switched back to the default framebuffer.
fn main_pass_start(commands: &[DeviceCommand]) -> usize {
    commands
        .iter()
        .rposition(|command| matches!(command, DeviceCommand::SetRenderTarget(None)))
        .expect("main pass was never started")
}

fn programs_used(commands: &[DeviceCommand]) -> Vec<ProgramId> {
    commands
        .iter()
        .filter_map(|command| match command {
            DeviceCommand::UseProgram(id) => Some(*id),
            _ => None,
        })
        .collect()
}

fn draws(commands: &[DeviceCommand]) -> usize {
    commands
        .iter()
        .filter(|command| matches!(command, DeviceCommand::Draw(_)))
        .count()
}

#[test]
fn one_shadow_pass_precedes_color_draws() {
    let mut fixture = shadow_scene();
    let mut renderer = renderer(shadow_settings());

    renderer.render(&mut fixture.scene, &fixture.camera).unwrap();

    let commands = renderer.device().commands();
    let shadow_targets: Vec<usize> = commands
        .iter()
        .enumerate()
        .filter(|(_, command)| matches!(command, DeviceCommand::SetRenderTarget(Some(_))))
        .map(|(index, _)| index)
        .collect();
    assert_eq!(shadow_targets.len(), 1);

    let main = main_pass_start(commands);
    assert!(shadow_targets[0] < main);

    let first_color_draw = commands[main..]
        .iter()
        .position(|command| matches!(command, DeviceCommand::Draw(_)))
        .map(|offset| main + offset)
        .unwrap();
    assert!(shadow_targets[0] < first_color_draw);

    assert_eq!(draws(&commands[..main]), 1);
    assert_eq!(renderer.info().shadow_calls, 1);
}

#[test]
fn each_mesh_is_drawn_once_opaque_first() {
    let mut fixture = shadow_scene();
    let mut renderer = renderer(shadow_settings());

    renderer.render(&mut fixture.scene, &fixture.camera).unwrap();

    let device = renderer.device();
    let commands = device.commands();
    let main = &commands[main_pass_start(commands)..];
    assert_eq!(draws(main), 2);

    let programs = programs_used(main);
    assert_eq!(programs.len(), 2);
    assert_ne!(programs[0], programs[1]);
    assert!(device.program(programs[0]).unwrap().label.starts_with("standard"));
    assert!(device.program(programs[1]).unwrap().label.starts_with("basic"));

    let info = renderer.info();
    assert_eq!(info.calls, 3);
    assert_eq!(info.triangles, 3 * 12);
}

#[test]
fn shadow_map_is_sampled_by_receivers() {
    let mut fixture = shadow_scene();
    let mut renderer = renderer(shadow_settings());

    renderer.render(&mut fixture.scene, &fixture.camera).unwrap();

    let device = renderer.device();
    let target = device
        .commands()
        .iter()
        .find_map(|command| match command {
            DeviceCommand::CreateRenderTarget { id, width, height } => {
                assert_eq!((*width, *height), (512, 512));
                Some(*id)
            }
            _ => None,
        })
        .unwrap();
    let map = device.render_target_texture(target).unwrap();

    let commands = device.commands();
    let main = &commands[main_pass_start(commands)..];
    assert!(main.iter().any(|command| matches!(
        command,
        DeviceCommand::BindTexture { texture: Some(texture), .. } if *texture == map
    )));
}

#[test]
fn disabled_shadows_skip_the_sub_pass() {
    let mut fixture = shadow_scene();
    let mut renderer = renderer(RenderSettings::default());

    renderer.render(&mut fixture.scene, &fixture.camera).unwrap();

    let commands = renderer.device().commands();
    assert!(!commands
        .iter()
        .any(|command| matches!(command, DeviceCommand::SetRenderTarget(Some(_)))));
    assert_eq!(draws(commands), 2);
    assert_eq!(renderer.info().shadow_calls, 0);
}

#[test]
fn second_frame_reuses_programs_and_buffers() {
    let mut fixture = shadow_scene();
    let mut renderer = renderer(shadow_settings());

    renderer.render(&mut fixture.scene, &fixture.camera).unwrap();
    let programs = renderer.device().live_programs();
    let buffers = renderer.device().live_buffers();
    renderer.device_mut().clear_commands();

    renderer.render(&mut fixture.scene, &fixture.camera).unwrap();

    let device = renderer.device();
    assert_eq!(device.live_programs(), programs);
    assert_eq!(device.live_buffers(), buffers);
    assert!(!device.commands().iter().any(|command| matches!(
        command,
        DeviceCommand::CreateProgram { .. } | DeviceCommand::CreateBuffer { .. }
    )));
    assert_eq!(renderer.info().frame, 2);
}

#[test]
fn changing_a_material_flag_compiles_a_new_program() {
    let mut fixture = shadow_scene();
    let mut renderer = renderer(RenderSettings::default());
    renderer.render(&mut fixture.scene, &fixture.camera).unwrap();
    renderer.device_mut().clear_commands();

    let material = fixture.scene.assets.materials.get_mut(fixture.opaque).unwrap();
    material.flat_shading = true;
    material.bump_version();
    renderer.render(&mut fixture.scene, &fixture.camera).unwrap();

    let created = renderer
        .device()
        .commands()
        .iter()
        .filter(|command| matches!(command, DeviceCommand::CreateProgram { .. }))
        .count();
    assert_eq!(created, 1);
}

/// A single lit cube, so every program in the cache belongs to it.
fn lit_cube() -> (Scene, Camera) {
    let mut scene = Scene::new();
    let cube = scene.assets.geometries.insert(Geometry::cuboid(1.0, 1.0, 1.0));
    let material = scene.assets.materials.insert(Material::standard(Vec3::ONE));
    scene
        .entity()
        .with_renderable(Renderable::mesh(cube, material))
        .spawn();
    let camera = Camera::perspective(60f32.to_radians(), 4.0 / 3.0, 0.1, 100.0)
        .looking_at(Vec3::new(0.0, 2.0, 8.0), Vec3::ZERO);
    (scene, camera)
}

fn created_programs(commands: &[DeviceCommand]) -> Vec<(usize, ProgramId)> {
    commands
        .iter()
        .enumerate()
        .filter_map(|(i, command)| match command {
            DeviceCommand::CreateProgram { id, .. } => Some((i, *id)),
            _ => None,
        })
        .collect()
}

fn deleted_programs(commands: &[DeviceCommand]) -> Vec<(usize, ProgramId)> {
    commands
        .iter()
        .enumerate()
        .filter_map(|(i, command)| match command {
            DeviceCommand::DeleteProgram(id) => Some((i, *id)),
            _ => None,
        })
        .collect()
}

/// Renders once after `change` and checks that exactly one program replaced
/// `previous`, released before the new one was compiled.
fn assert_program_replaced(
    renderer: &mut Renderer<RecordingDevice>,
    scene: &mut Scene,
    camera: &Camera,
    previous: ProgramId,
) -> ProgramId {
    renderer.device_mut().clear_commands();
    renderer.render(scene, camera).unwrap();

    let commands = renderer.device().commands();
    let created = created_programs(commands);
    let deleted = deleted_programs(commands);
    assert_eq!(created.len(), 1);
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].1, previous);
    assert!(deleted[0].0 < created[0].0);
    assert_eq!(renderer.info().programs, 1);
    created[0].1
}

fn first_program(renderer: &mut Renderer<RecordingDevice>, scene: &mut Scene, camera: &Camera) -> ProgramId {
    renderer.render(scene, camera).unwrap();
    let created = created_programs(renderer.device().commands());
    assert_eq!(created.len(), 1);
    created[0].1
}

#[test]
fn adding_lights_replaces_the_program_instead_of_accumulating() {
    let (mut scene, camera) = lit_cube();
    let mut renderer = renderer(RenderSettings::default());
    let mut program = first_program(&mut renderer, &mut scene, &camera);

    for i in 0..4 {
        scene
            .entity()
            .with_transform(Transform::from_translation(Vec3::new(i as f32, 3.0, 0.0)))
            .with_light(Light::point(Vec3::ONE, 1.0, 20.0))
            .spawn();
        program = assert_program_replaced(&mut renderer, &mut scene, &camera, program);
    }
    assert_eq!(renderer.device().live_programs(), 1);
}

#[test]
fn enabling_fog_replaces_the_program() {
    let (mut scene, camera) = lit_cube();
    let mut renderer = renderer(RenderSettings::default());
    let program = first_program(&mut renderer, &mut scene, &camera);

    scene.fog = Some(Fog::Exp2 {
        color: Vec3::splat(0.5),
        density: 0.05,
    });
    assert_program_replaced(&mut renderer, &mut scene, &camera, program);
}

#[test]
fn clipping_plane_count_replaces_the_program() {
    let (mut scene, camera) = lit_cube();
    let mut renderer = renderer(RenderSettings::default());
    let program = first_program(&mut renderer, &mut scene, &camera);

    renderer.set_clipping_planes(vec![Plane::new(Vec3::X, 0.0)]);
    let program = assert_program_replaced(&mut renderer, &mut scene, &camera, program);

    renderer.set_clipping_planes(Vec::new());
    assert_program_replaced(&mut renderer, &mut scene, &camera, program);
}

#[test]
fn unchanged_state_keeps_the_program() {
    let (mut scene, camera) = lit_cube();
    let mut renderer = renderer(RenderSettings::default());
    first_program(&mut renderer, &mut scene, &camera);

    renderer.device_mut().clear_commands();
    renderer.render(&mut scene, &camera).unwrap();
    let commands = renderer.device().commands();
    assert!(created_programs(commands).is_empty());
    assert!(deleted_programs(commands).is_empty());
}

#[test]
fn device_loss_aborts_the_frame_and_rebuilds_lazily() {
    let mut fixture = shadow_scene();
    let mut renderer = renderer(shadow_settings());
    renderer.render(&mut fixture.scene, &fixture.camera).unwrap();

    renderer.device_mut().lose_device();
    let result = renderer.render(&mut fixture.scene, &fixture.camera);
    assert!(matches!(result, Err(RenderError::DeviceLost(_))));
    assert_eq!(renderer.info().programs, 0);

    renderer.device_mut().restore_device();
    renderer.device_mut().clear_commands();
    renderer.render(&mut fixture.scene, &fixture.camera).unwrap();

    let device = renderer.device();
    assert!(device.live_programs() >= 3);
    assert!(device.live_buffers() > 0);
    let commands = device.commands();
    assert_eq!(draws(&commands[main_pass_start(commands)..]), 2);
}

#[test]
fn failed_compilation_skips_only_that_item() {
    let mut fixture = shadow_scene();
    let mut renderer = renderer(RenderSettings::default());
    renderer.device_mut().fail_programs_labelled("basic");

    renderer.render(&mut fixture.scene, &fixture.camera).unwrap();

    assert_eq!(draws(renderer.device().commands()), 1);
    assert!(renderer.info().warnings >= 1);
}

#[test]
fn compile_resolves_programs_without_drawing() {
    let mut fixture = shadow_scene();
    let mut renderer = renderer(shadow_settings());

    renderer.compile(&mut fixture.scene, &fixture.camera).unwrap();
    let compiled = renderer.device().live_programs();
    assert_eq!(compiled, 2);
    assert_eq!(draws(renderer.device().commands()), 0);

    renderer.device_mut().clear_commands();
    renderer.render(&mut fixture.scene, &fixture.camera).unwrap();
    let created: Vec<String> = renderer
        .device()
        .commands()
        .iter()
        .filter_map(|command| match command {
            DeviceCommand::CreateProgram { label, .. } => Some(label.clone()),
            _ => None,
        })
        .collect();
    // Only the shadow depth program is new.
    assert_eq!(created.len(), 1);
    assert!(created[0].starts_with("depth"));
}

#[test]
fn sub_cameras_draw_the_list_into_each_viewport() {
    let mut fixture = shadow_scene();
    let mut renderer = renderer(RenderSettings::default());
    let left = Viewport::new(0.0, 0.0, 320.0, 480.0);
    let right = Viewport::new(320.0, 0.0, 320.0, 480.0);
    let camera = fixture
        .camera
        .clone()
        .with_sub_camera(fixture.camera.clone(), left)
        .with_sub_camera(fixture.camera.clone(), right);

    renderer.render(&mut fixture.scene, &camera).unwrap();

    let commands = renderer.device().commands();
    assert_eq!(draws(commands), 4);
    let viewports: Vec<Viewport> = commands
        .iter()
        .filter_map(|command| match command {
            DeviceCommand::SetViewport(viewport) => Some(*viewport),
            _ => None,
        })
        .collect();
    assert!(viewports.contains(&left));
    assert!(viewports.contains(&right));
}

#[test]
fn instanced_mesh_draws_every_instance_in_one_call() {
    let mut fixture = shadow_scene();
    let matrices: Vec<Mat4> = (0..5)
        .map(|i| Mat4::from_translation(Vec3::new(i as f32, 0.0, -3.0)))
        .collect();
    fixture
        .scene
        .entity()
        .with_renderable(Renderable::new(
            DrawableKind::InstancedMesh { count: 5 },
            fixture.cube,
            fixture.opaque,
        ))
        .with_instances(InstanceMatrices::from_matrices(&matrices))
        .spawn();
    let mut renderer = renderer(RenderSettings::default());

    renderer.render(&mut fixture.scene, &fixture.camera).unwrap();

    let calls = renderer.device().draw_calls();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().any(|call| call.instance_count == 5));
}

#[test]
fn disposing_releases_gpu_resources() {
    let mut fixture = shadow_scene();
    let mut renderer = renderer(shadow_settings());
    renderer.render(&mut fixture.scene, &fixture.camera).unwrap();

    let glass = fixture.scene.assets.materials.get(fixture.glass).unwrap().clone();
    let before = renderer.device().live_programs();
    renderer.dispose_material(&glass);
    assert_eq!(renderer.device().live_programs(), before - 1);

    renderer.dispose();
    let device = renderer.device();
    assert_eq!(device.live_programs(), 0);
    assert_eq!(device.live_buffers(), 0);
    assert_eq!(device.live_textures(), 0);
}
