use actix_web::{web, App, HttpServer};
use diesel::r2d2::ConnectionManager;
use diesel::PgConnection;
use diesel_migrations::MigrationHarness;
use dotenv::dotenv;
use gringotts::app::{self, AppCfg, AppState};
use gringotts::db;
use log::info;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init();

    let cfg = AppCfg::from_env();

    let manager = ConnectionManager::<PgConnection>::new(cfg.database_url.as_str());
    let pool = r2d2::Pool::builder()
        .build(manager)
        .expect("Failed to create pool.");

    {
        let mut conn = pool.get().expect("cannot check out a connection");
        conn.run_pending_migrations(db::MIGRATIONS)
            .expect("cannot run migrations");
    }

    info!("starting gringotts on {}", cfg.host);
    let host = cfg.host.clone();
    let state = web::Data::new(AppState::new(cfg, pool));

    HttpServer::new(move || App::new().app_data(state.clone()).configure(app::routing))
        .bind(&host)?
        .run()
        .await
}
