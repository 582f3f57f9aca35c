//! Background sweeps: the expiry reaper and the webhook delivery loop.

use crate::db::{
    DbExecutor, DueNotifications, ExpiredCandidates, GetMerchant, MarkNotificationDelivered,
    NotificationAttempt,
};
use crate::fsm::{ExpirePayment, Fsm};
use crate::notifier;
use actix::prelude::*;
use awc::Client;
use chrono::Utc;
use futures::future::join_all;
use log::{debug, error, info, warn};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CronConfig {
    pub reaper_interval: Duration,
    pub reaper_batch: i64,
    pub notify_interval: Duration,
    pub notify_batch: i64,
    pub backoff_base: Duration,
    pub max_delivery_attempts: i32,
}

impl Default for CronConfig {
    fn default() -> Self {
        CronConfig {
            reaper_interval: Duration::from_secs(30),
            reaper_batch: 1_000,
            notify_interval: Duration::from_secs(5),
            notify_batch: 100,
            backoff_base: notifier::DEFAULT_BACKOFF_BASE,
            max_delivery_attempts: notifier::MAX_DELIVERY_ATTEMPTS,
        }
    }
}

pub struct Cron {
    db: Addr<DbExecutor>,
    fsm: Addr<Fsm>,
    cfg: CronConfig,
}

impl Actor for Cron {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(
            "starting cron: reaper every {:?}, notifier every {:?}",
            self.cfg.reaper_interval, self.cfg.notify_interval
        );
        ctx.run_interval(self.cfg.reaper_interval, sweep_expired_payments);
        ctx.run_interval(self.cfg.notify_interval, sweep_due_notifications);
    }
}

impl Cron {
    pub fn new(db: Addr<DbExecutor>, fsm: Addr<Fsm>, cfg: CronConfig) -> Self {
        Cron { db, fsm, cfg }
    }
}

fn sweep_expired_payments(cron: &mut Cron, _: &mut Context<Cron>) {
    debug!("run sweep_expired_payments");
    let db = cron.db.clone();
    let fsm = cron.fsm.clone();
    let batch = cron.cfg.reaper_batch;
    actix::spawn(async move {
        let candidates = match db.send(ExpiredCandidates { limit: batch }).await {
            Ok(Ok(candidates)) => candidates,
            Ok(Err(e)) => return error!("cannot list expired payments: {}", e),
            Err(e) => return error!("cannot list expired payments: {}", e),
        };
        if candidates.is_empty() {
            return;
        }
        debug!("found {} timed-out payments", candidates.len());
        let sweeps = candidates.into_iter().map(|payment| {
            let fsm = fsm.clone();
            async move {
                match fsm
                    .send(ExpirePayment {
                        payment_id: payment.id.clone(),
                    })
                    .await
                {
                    Ok(Ok(expired)) => {
                        info!("payment {} expired into {}", expired.id, expired.status)
                    }
                    Ok(Err(e)) => warn!("cannot expire payment {}: {}", payment.id, e),
                    Err(e) => warn!("cannot expire payment {}: {}", payment.id, e),
                }
            }
        });
        join_all(sweeps).await;
    });
}

fn sweep_due_notifications(cron: &mut Cron, _: &mut Context<Cron>) {
    debug!("run sweep_due_notifications");
    let db = cron.db.clone();
    let batch = cron.cfg.notify_batch;
    let max_attempts = cron.cfg.max_delivery_attempts;
    let backoff_base = cron.cfg.backoff_base;
    actix::spawn(async move {
        let heads = match db
            .send(DueNotifications {
                limit: batch,
                max_attempts,
            })
            .await
        {
            Ok(Ok(heads)) => heads,
            Ok(Err(e)) => return error!("cannot list due notifications: {}", e),
            Err(e) => return error!("cannot list due notifications: {}", e),
        };
        let now = Utc::now().naive_utc();
        let due: Vec<_> = heads
            .into_iter()
            .filter(|n| n.next_attempt_at.map(|at| at <= now).unwrap_or(true))
            .collect();
        if due.is_empty() {
            return;
        }
        debug!("delivering {} webhooks", due.len());

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .finish();

        // one head per payment, so parallel delivery cannot reorder a
        // single payment's stream
        let deliveries = due.into_iter().map(|notification| {
            let db = db.clone();
            let client = client.clone();
            async move {
                let merchant = match db
                    .send(GetMerchant {
                        team_slug: notification.team_slug.clone(),
                    })
                    .await
                {
                    Ok(Ok(merchant)) => merchant,
                    Ok(Err(e)) => {
                        return warn!(
                            "webhook {} skipped, merchant lookup failed: {}",
                            notification.id, e
                        )
                    }
                    Err(e) => {
                        return warn!(
                            "webhook {} skipped, merchant lookup failed: {}",
                            notification.id, e
                        )
                    }
                };

                let update = match notifier::deliver(&client, &notification, &merchant.password)
                    .await
                {
                    Ok(()) => {
                        info!(
                            "webhook {} ({}) delivered to {}",
                            notification.id, notification.event, notification.callback_url
                        );
                        db.send(MarkNotificationDelivered {
                            notification_id: notification.id,
                        })
                        .await
                        .map(|r| r.map(|_| ()))
                    }
                    Err(failure) if failure.permanent => {
                        warn!(
                            "webhook {} abandoned permanently: {}",
                            notification.id, failure.error
                        );
                        db.send(NotificationAttempt {
                            notification_id: notification.id,
                            error: failure.error,
                            next_attempt_at: None,
                            abandon_at: Some(max_attempts),
                        })
                        .await
                        .map(|r| r.map(|_| ()))
                    }
                    Err(failure) => {
                        let backoff = notifier::next_backoff(notification.attempts, backoff_base);
                        let next = now
                            + chrono::Duration::from_std(backoff)
                                .unwrap_or_else(|_| chrono::Duration::hours(24));
                        warn!(
                            "webhook {} attempt {} failed ({}), retrying at {}",
                            notification.id,
                            notification.attempts + 1,
                            failure.error,
                            next
                        );
                        db.send(NotificationAttempt {
                            notification_id: notification.id,
                            error: failure.error,
                            next_attempt_at: Some(next),
                            abandon_at: None,
                        })
                        .await
                        .map(|r| r.map(|_| ()))
                    }
                };
                match update {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("cannot update webhook {}: {}", notification.id, e),
                    Err(e) => error!("cannot update webhook {}: {}", notification.id, e),
                }
            }
        });
        join_all(deliveries).await;
    });
}
