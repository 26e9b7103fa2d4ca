use log::{error, info};

gflags::define! {
    --config: &str = "particles.toml"
}
gflags::define! {
    --log_filter: &str = "warn,particle_compute=info"
}
gflags::define! {
    -h, --help = false
}

fn main() {
    gflags::parse();
    if HELP.flag {
        gflags::print_help_and_exit(0);
    }
    if let Err(e) = scrub_log::init_with_filter_string(LOG_FILTER.flag) {
        eprintln!("Failed to initialize logging: {:?}", e);
        std::process::exit(1);
    }

    let params = particle_compute::sim_params::get_params(CONFIG.flag);
    info!(
        "Simulating {} particles in a {}x{} window",
        params.num_particles, params.window_width, params.window_height
    );
    if let Err(e) = particle_compute::framework::run(params) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
