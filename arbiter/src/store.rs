//! The transactional boundary to the attempt queue.
//!
//! All SQL lives here. The queue is shared between workers; mutual
//! exclusion on claiming relies entirely on the serialisable transaction
//! in [`AttemptStore::claim_next`].

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, IsolationLevel, NoTls, Row};

use crate::model::{Attempt, Compiler, Contest, Problem, ProblemInContest, User};

/// Identifier of a worker's liveness row.
pub type HeartbeatId = i32;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_postgres::Error),
}

/// One write against a claimed attempt.
///
/// `result` is always written and `updated_at` always stamped; the
/// optional groups select which further columns the write touches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultUpdate {
    pub result: String,
    pub error_message: Option<String>,
    pub used_time: Option<f64>,
    pub used_memory: Option<f64>,
    pub score: Option<f64>,
    pub checker_comment: Option<String>,
}

impl ResultUpdate {
    /// A transient or terminal state with no attached data.
    pub fn state(result: impl Into<String>) -> ResultUpdate {
        ResultUpdate {
            result: result.into(),
            ..ResultUpdate::default()
        }
    }

    /// Attaches a compilation diagnostic.
    pub fn with_error(mut self, message: impl Into<String>) -> ResultUpdate {
        self.error_message = Some(message.into());
        self
    }

    /// Attaches resource usage: seconds of CPU time and megabytes of
    /// memory.
    pub fn with_stats(mut self, used_time: f64, used_memory: f64) -> ResultUpdate {
        self.used_time = Some(used_time);
        self.used_memory = Some(used_memory);
        self
    }

    /// Attaches a school-mode score, on the 0–100 scale.
    pub fn with_score(mut self, score: f64) -> ResultUpdate {
        self.score = Some(score);
        self
    }

    /// Attaches the checker's comment.
    pub fn with_comment(mut self, comment: impl Into<String>) -> ResultUpdate {
        self.checker_comment = Some(comment.into());
        self
    }

    /// The SET clause and its parameters. The attempt id is `$1`, so the
    /// clause numbers its placeholders from `$2`.
    fn clause(&self) -> (String, Vec<&(dyn ToSql + Sync)>) {
        let mut sets = vec!["result = $2".to_owned()];
        let mut params: Vec<&(dyn ToSql + Sync)> = vec![&self.result];
        let push = |sets: &mut Vec<String>, column: &str| {
            sets.push(format!("{column} = ${}", sets.len() + 2));
        };
        if let Some(message) = &self.error_message {
            push(&mut sets, "error_message");
            params.push(message);
        }
        if let Some(used_time) = &self.used_time {
            push(&mut sets, "used_time");
            params.push(used_time);
        }
        if let Some(used_memory) = &self.used_memory {
            push(&mut sets, "used_memory");
            params.push(used_memory);
        }
        if let Some(score) = &self.score {
            push(&mut sets, "score");
            params.push(score);
        }
        if let Some(comment) = &self.checker_comment {
            push(&mut sets, "checker_comment");
            params.push(comment);
        }
        sets.push("updated_at = NOW()".to_owned());
        (sets.join(", "), params)
    }
}

/// The operations the worker loop and the judging pipeline need from the
/// queue. A trait so the pipeline can run against an in-memory store in
/// tests.
#[async_trait]
pub trait AttemptStore {
    /// Creates this worker's liveness row and returns its id.
    async fn register_worker(&mut self) -> Result<HeartbeatId, StoreError>;

    /// Bumps the liveness row's timestamp. Idempotent.
    async fn heartbeat(&mut self, id: HeartbeatId) -> Result<(), StoreError>;

    /// Deletes the liveness row.
    async fn unregister(&mut self, id: HeartbeatId) -> Result<(), StoreError>;

    /// Atomically claims the oldest untested attempt whose compiler and
    /// runner codenames are both available on this worker. Returns `None`
    /// when the queue has nothing claimable.
    async fn claim_next(
        &mut self,
        tester_name: &str,
        initial_result: &str,
        compilers: &[String],
        runners: &[String],
    ) -> Result<Option<Attempt>, StoreError>;

    /// Writes a state transition of a claimed attempt.
    async fn update_result(&mut self, id: i32, update: ResultUpdate) -> Result<(), StoreError>;

    /// Records one per-test row; school contests only. Time is in
    /// seconds, memory in kilobytes.
    async fn record_test_info(
        &mut self,
        attempt_id: i32,
        test_number: i32,
        result: &str,
        used_time: f64,
        used_memory: f64,
        checker_comment: &str,
    ) -> Result<(), StoreError>;
}

const CLAIM_QUERY: &str = "\
    SELECT
        a.id, a.source,
        pic.problem_id, p.name, p.path, p.time_limit, p.memory_limit,
        p.checker, p.mask_in, p.mask_out,
        pic.contest_id, c.is_school,
        pic.number,
        u.login, u.username,
        comp.name, comp.codename, comp.runner_codename
    FROM attempts a
    JOIN compilers comp ON comp.id = a.compiler_id
    JOIN users u ON u.id = a.user_id
    JOIN problem_in_contests pic ON pic.id = a.problem_in_contest_id
    JOIN problems p ON p.id = pic.problem_id
    JOIN contests c ON c.id = pic.contest_id
    WHERE COALESCE(a.result, '') = ''
    AND   comp.codename = ANY($1)
    AND   comp.runner_codename = ANY($2)
    ORDER BY a.time
    LIMIT 1";

const ACQUIRE: &str = "\
    UPDATE attempts
    SET tester_name = $2,
        result = $3,
        error_message = NULL,
        checker_comment = '',
        used_time = NULL,
        used_memory = NULL,
        score = NULL,
        updated_at = NOW()
    WHERE id = $1";

/// Store implementation over a single Postgres connection.
pub struct PgStore {
    client: Client,
    connection: JoinHandle<()>,
}

impl PgStore {
    /// Connects using a `tokio-postgres` config string.
    pub async fn connect(locator: &str) -> Result<PgStore, StoreError> {
        let (client, connection) = tokio_postgres::connect(locator, NoTls).await?;
        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("queue connection error: {e}");
            }
        });
        Ok(PgStore { client, connection })
    }

    /// Drops the client and waits for the connection task to wind down.
    pub async fn close(self) {
        let PgStore { client, connection } = self;
        drop(client);
        connection.await.ok();
    }

    async fn try_claim(
        &mut self,
        tester_name: &str,
        initial_result: &str,
        compilers: &[String],
        runners: &[String],
    ) -> Result<Option<Attempt>, tokio_postgres::Error> {
        let transaction = self
            .client
            .build_transaction()
            .isolation_level(IsolationLevel::Serializable)
            .start()
            .await?;
        let Some(row) = transaction
            .query_opt(CLAIM_QUERY, &[&compilers, &runners])
            .await?
        else {
            transaction.commit().await?;
            return Ok(None);
        };
        let id: i32 = row.get(0);
        transaction
            .execute(ACQUIRE, &[&id, &tester_name, &initial_result])
            .await?;
        transaction.commit().await?;
        Ok(Some(hydrate(&row)))
    }
}

#[async_trait]
impl AttemptStore for PgStore {
    async fn register_worker(&mut self) -> Result<HeartbeatId, StoreError> {
        let row = self
            .client
            .query_one(
                "INSERT INTO checker_statuses (updated_at) VALUES (NOW()) RETURNING id",
                &[],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn heartbeat(&mut self, id: HeartbeatId) -> Result<(), StoreError> {
        self.client
            .execute(
                "UPDATE checker_statuses SET updated_at = NOW() WHERE id = $1",
                &[&id],
            )
            .await?;
        Ok(())
    }

    async fn unregister(&mut self, id: HeartbeatId) -> Result<(), StoreError> {
        self.client
            .execute("DELETE FROM checker_statuses WHERE id = $1", &[&id])
            .await?;
        Ok(())
    }

    async fn claim_next(
        &mut self,
        tester_name: &str,
        initial_result: &str,
        compilers: &[String],
        runners: &[String],
    ) -> Result<Option<Attempt>, StoreError> {
        loop {
            match self
                .try_claim(tester_name, initial_result, compilers, runners)
                .await
            {
                Err(e) if serialization_conflict(&e) => continue,
                other => return other.map_err(StoreError::from),
            }
        }
    }

    async fn update_result(&mut self, id: i32, update: ResultUpdate) -> Result<(), StoreError> {
        let (clause, clause_params) = update.clause();
        let sql = format!("UPDATE attempts SET {clause} WHERE id = $1");
        let params: Vec<&(dyn ToSql + Sync)> = std::iter::once(&id as &(dyn ToSql + Sync))
            .chain(clause_params)
            .collect();
        self.client.execute(&sql, &params).await?;
        Ok(())
    }

    async fn record_test_info(
        &mut self,
        attempt_id: i32,
        test_number: i32,
        result: &str,
        used_time: f64,
        used_memory: f64,
        checker_comment: &str,
    ) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO test_infos \
                     (attempt_id, test_number, result, used_time, used_memory, checker_comment) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[
                    &attempt_id,
                    &test_number,
                    &result,
                    &used_time,
                    &used_memory,
                    &checker_comment,
                ],
            )
            .await?;
        Ok(())
    }
}

fn serialization_conflict(e: &tokio_postgres::Error) -> bool {
    e.code() == Some(&SqlState::T_R_SERIALIZATION_FAILURE)
}

fn hydrate(row: &Row) -> Attempt {
    let problem = Problem {
        id: row.get(2),
        name: row.get(3),
        path: row.get(4),
        time_limit: row.get(5),
        memory_limit: row.get(6),
        checker: row.get(7),
        mask_in: row.get(8),
        mask_out: row.get(9),
    };
    let contest = Contest {
        id: row.get(10),
        is_school: row.get(11),
    };
    Attempt {
        id: row.get(0),
        pic: ProblemInContest {
            problem,
            contest,
            number: row.get(12),
        },
        user: User {
            login: row.get(13),
            username: row.get(14),
        },
        source: row.get(1),
        compiler: Compiler {
            name: row.get(15),
            codename: row.get(16),
            runner_codename: row.get(17),
        },
    }
}
