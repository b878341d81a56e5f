//! Table creation straight from the entity definitions. Every statement is
//! `IF NOT EXISTS`, so running it on each start-up is harmless.

use sea_orm::{ConnectionTrait, DatabaseConnection, DbErr, EntityName, EntityTrait, Schema};
use tracing::{debug, info};

use crate::db::entities::{access_log, node, node_inbound, subscription, subscription_node};

pub async fn ensure_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    // Parents before children so foreign keys resolve on every backend.
    create_table(db, node::Entity).await?;
    create_table(db, node_inbound::Entity).await?;
    create_table(db, subscription::Entity).await?;
    create_table(db, subscription_node::Entity).await?;
    create_table(db, access_log::Entity).await?;
    info!("Database schema is up to date.");
    Ok(())
}

async fn create_table<E: EntityTrait>(db: &DatabaseConnection, entity: E) -> Result<(), DbErr> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    let mut table = schema.create_table_from_entity(entity);
    table.if_not_exists();
    db.execute(backend.build(&table)).await?;

    for mut index in schema.create_index_from_entity(entity) {
        index.if_not_exists();
        db.execute(backend.build(&index)).await?;
    }
    debug!(table = entity.table_name(), "Ensured table.");
    Ok(())
}
