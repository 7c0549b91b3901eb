//! The turn controller: one `handle_turn` per `controller_turn` call,
//! implementing the per-turn algorithm — identity resolution, budget
//! accounting, the capability gate, verb dispatch, envelope events,
//! friction tracking, the promotion lane, and envelope assembly.

use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value as JsonValue;
use serde_json::json;
use uuid::Uuid;

use crate::adapters::ExternalFetchers;
use crate::adapters::GraphAdapter;
use crate::adapters::IndexAdapter;
use crate::adapters::SnapshotGraph;
use crate::adapters::SnapshotIndex;
use crate::adapters::StaticGlossary;
use crate::budget::estimate_tokens;
use crate::capability;
use crate::collision::CollisionGuard;
use crate::config::Config;
use crate::context_pack;
use crate::context_pack::PackInputs;
use crate::enforcement::build_enforcement_bundle;
use crate::error::Result;
use crate::events;
use crate::events::EventLog;
use crate::memory::MemoryStore;
use crate::plan_validator;
use crate::plan_validator::ValidationInput;
use crate::retrieval;
use crate::session::ResolvedIds;
use crate::session::SessionRegistry;
use crate::session::WorkKey;
use crate::session::WorkUnit;
use warden_protocol::BudgetStatus;
use warden_protocol::DenyCode;
use warden_protocol::ENVELOPE_SCHEMA_VERSION;
use warden_protocol::EventKind;
use warden_protocol::KnowledgeStrategy;
use warden_protocol::PackInsufficiency;
use warden_protocol::PlanDocument;
use warden_protocol::PlanNodeKind;
use warden_protocol::ProgressSummary;
use warden_protocol::RequestedEvidence;
use warden_protocol::ResponseEnvelope;
use warden_protocol::ScopeInfo;
use warden_protocol::SessionState;
use warden_protocol::SubAgentHints;
use warden_protocol::TurnOutcome;
use warden_protocol::TurnRequest;
use warden_protocol::Verb;

/// What a verb handler hands back to the turn loop.
pub(crate) struct HandlerOutcome {
    pub result: JsonValue,
    pub deny: Vec<DenyCode>,
    pub state_override: Option<SessionState>,
    pub suggested_action: Option<String>,
    pub pack_insufficiency: Option<PackInsufficiency>,
}

impl HandlerOutcome {
    pub fn ok(result: JsonValue) -> Self {
        Self {
            result,
            deny: Vec::new(),
            state_override: None,
            suggested_action: None,
            pack_insufficiency: None,
        }
    }

    pub fn deny_with(code: DenyCode, result: JsonValue) -> Self {
        Self {
            result,
            deny: vec![code],
            state_override: None,
            suggested_action: None,
            pack_insufficiency: None,
        }
    }

    pub fn bad_args(e: serde_json::Error) -> Self {
        Self::deny_with(
            DenyCode::PlanMissingRequiredFields,
            json!({"error": e.to_string()}),
        )
    }

    pub fn bad_args_msg(msg: &str) -> Self {
        Self::deny_with(DenyCode::PlanMissingRequiredFields, json!({"error": msg}))
    }
}

/// Everything a verb handler may need for one turn.
pub(crate) struct TurnContext<'a> {
    pub config: &'a Config,
    pub ids: &'a ResolvedIds,
    pub key: &'a WorkKey,
    pub unit: &'a Arc<tokio::sync::Mutex<WorkUnit>>,
    pub collision: &'a Arc<CollisionGuard>,
    pub events: &'a EventLog,
    pub memory: &'a MemoryStore,
    pub index: &'a dyn IndexAdapter,
    pub graph: &'a dyn GraphAdapter,
    pub fetchers: &'a ExternalFetchers,
    pub glossary: &'a StaticGlossary,
    pub trace_ref: &'a str,
}

/// The composed kernel behind the single `controller_turn` tool.
pub struct Controller {
    config: Config,
    registry: SessionRegistry,
    collision: Arc<CollisionGuard>,
    events: EventLog,
    memory: MemoryStore,
    index: SnapshotIndex,
    graph: SnapshotGraph,
    fetchers: ExternalFetchers,
    glossary: StaticGlossary,
}

impl Controller {
    /// Build the kernel and rebuild the session cache from the event log.
    pub async fn new(config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.state_root).await?;
        let events = EventLog::new(&config.state_root).await?;
        let memory = MemoryStore::load(&config.state_root)?;
        let index = SnapshotIndex::load(&config.state_root)?;
        let graph = SnapshotGraph::load(&config.state_root)?;
        let fetchers = ExternalFetchers::new(config.fetchers.clone());

        let controller = Self {
            config,
            registry: SessionRegistry::new(),
            collision: CollisionGuard::new(),
            events,
            memory,
            index,
            graph,
            fetchers,
            glossary: StaticGlossary::default(),
        };

        let replayed = events::replay(controller.events.path()).await?;
        if !replayed.is_empty() {
            controller.registry.rebuild_from_events(&replayed).await;
            tracing::info!("rebuilt session cache from {} event rows", replayed.len());
        }
        Ok(controller)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Process one turn. Never returns an error: every failure becomes a
    /// coded deny inside a well-formed envelope.
    pub async fn handle_turn(&self, request: TurnRequest) -> ResponseEnvelope {
        let ids = self.registry.resolve_ids(
            request.run_session_id.as_deref(),
            request.work_id.as_deref(),
            request.agent_id.as_deref(),
        );
        let key = WorkKey {
            run_session_id: ids.run_session_id.clone(),
            work_id: ids.work_id.clone(),
        };
        let unit = self.registry.unit(&key);

        // Turns for the same session are serialized; other agents of the
        // work unit interleave at suspension points.
        let turn_lock = self.registry.turn_lock(&key, &ids.agent_id);
        let _turn = turn_lock.lock().await;

        let trace_ref = Uuid::new_v4().to_string();

        if ids.sub_agent_joined {
            let _ = self
                .events
                .append(
                    EventKind::SubAgentJoined,
                    &ids.run_session_id,
                    &ids.work_id,
                    &ids.agent_id,
                    json!({"traceRef": trace_ref}),
                )
                .await;
        }

        let _ = self
            .events
            .append(
                EventKind::InputEnvelope,
                &ids.run_session_id,
                &ids.work_id,
                &ids.agent_id,
                json!({
                    "verb": request.verb,
                    "args": request.args,
                    "originalPrompt": request.original_prompt,
                    "traceMeta": request.trace_meta,
                    "traceRef": trace_ref,
                }),
            )
            .await;

        // Prompt originality: the first non-empty prompt wins forever.
        {
            let mut unit = unit.lock().await;
            match (&unit.shared.original_prompt, &request.original_prompt) {
                (None, Some(prompt)) if !prompt.is_empty() => {
                    unit.shared.original_prompt = Some(prompt.clone());
                }
                (Some(stored), Some(prompt)) if !prompt.is_empty() && stored != prompt => {
                    let _ = self
                        .events
                        .append(
                            EventKind::PromptMismatch,
                            &ids.run_session_id,
                            &ids.work_id,
                            &ids.agent_id,
                            json!({"stored": stored, "received": prompt, "traceRef": trace_ref}),
                        )
                        .await;
                }
                _ => {}
            }
        }

        // Budget accounting happens before the capability gate so the
        // blocked state is entered exactly when the threshold trips.
        let estimate = estimate_tokens(
            &request.verb,
            request.original_prompt.as_deref(),
            request.args.as_ref(),
        );
        let verb = Verb::from_str(&request.verb).ok();
        let (used_tokens, budget_blocked) = {
            let mut unit = unit.lock().await;
            let agent = unit.agent_mut(&ids.agent_id);
            agent.used_tokens += estimate;
            let used = agent.used_tokens;
            let crossed = used >= self.config.threshold_tokens;
            let blocks = crossed && !verb.is_some_and(capability::is_budget_safe);
            if blocks {
                unit.shared.state = Some(SessionState::BlockedBudget);
            }
            (used, blocks)
        };

        let ctx = TurnContext {
            config: &self.config,
            ids: &ids,
            key: &key,
            unit: &unit,
            collision: &self.collision,
            events: &self.events,
            memory: &self.memory,
            index: &self.index,
            graph: &self.graph,
            fetchers: &self.fetchers,
            glossary: &self.glossary,
            trace_ref: &trace_ref,
        };

        let state_before = {
            let unit = unit.lock().await;
            unit.shared.state()
        };

        let outcome = if budget_blocked {
            let mut outcome = HandlerOutcome::deny_with(
                DenyCode::BudgetThresholdExceeded,
                json!({"usedTokens": used_tokens, "thresholdTokens": self.config.threshold_tokens}),
            );
            outcome.suggested_action =
                Some("escalate or signal_task_complete; budget threshold crossed".to_string());
            outcome
        } else {
            match verb {
                None => HandlerOutcome::deny_with(
                    DenyCode::PlanCapabilityScope,
                    json!({"verb": request.verb, "detail": "unknown verb"}),
                ),
                Some(verb) if !capability::is_permitted(state_before, verb) => {
                    HandlerOutcome::deny_with(
                        DenyCode::PlanCapabilityScope,
                        json!({"verb": request.verb, "state": state_before}),
                    )
                }
                Some(verb) => self.dispatch(&ctx, verb, &request).await,
            }
        };

        // Apply the handler's state transition.
        if let Some(next) = outcome.state_override {
            let mut unit = unit.lock().await;
            unit.shared.state = Some(next);
        }

        self.track_friction(&ctx, &outcome.deny).await;
        self.run_promotion_lane(&ids).await;

        let envelope = self
            .assemble_envelope(&ids, &unit, outcome, used_tokens, &trace_ref)
            .await;

        let _ = self
            .events
            .append(
                EventKind::OutputEnvelope,
                &ids.run_session_id,
                &ids.work_id,
                &ids.agent_id,
                json!({
                    "verb": request.verb,
                    "state": envelope.state,
                    "outcome": envelope.outcome,
                    "denyReasons": envelope.deny_reasons,
                    "usedTokens": used_tokens,
                    "traceRef": trace_ref,
                }),
            )
            .await;

        envelope
    }

    async fn dispatch(
        &self,
        ctx: &TurnContext<'_>,
        verb: Verb,
        request: &TurnRequest,
    ) -> HandlerOutcome {
        let args = request.args.clone().unwrap_or_else(|| json!({}));
        match verb {
            Verb::InitializeWork => {
                self.initialize_work(ctx, args, request.original_prompt.as_deref())
                    .await
            }
            Verb::ReadFileLines => crate::reads::read_file_lines(ctx, args).await,
            Verb::LookupSymbolDefinition => {
                crate::reads::lookup_symbol_definition(ctx, args).await
            }
            Verb::TraceSymbolGraph => crate::reads::trace_symbol_graph(ctx, args).await,
            Verb::SearchCodebaseText => crate::reads::search_codebase_text(ctx, args).await,
            Verb::WriteScratchFile => crate::reads::write_scratch_file(ctx, args).await,
            Verb::SubmitExecutionPlan => self.submit_execution_plan(ctx, args).await,
            Verb::Escalate => self.escalate(ctx, args).await,
            Verb::SignalTaskComplete => self.signal_task_complete(ctx, args).await,
            Verb::ApplyCodePatch => crate::apply_patch::apply_code_patch(ctx, args).await,
            Verb::RunSandboxedCode => crate::sandbox::run_sandboxed_code(ctx, args).await,
            Verb::ExecuteGatedSideEffect => {
                crate::side_effect::execute_gated_side_effect(ctx, args).await
            }
            Verb::RunAutomationRecipe => crate::recipes::run_automation_recipe(ctx, args).await,
        }
    }

    // -----------------------------------------------------------------
    // Lifecycle verbs
    // -----------------------------------------------------------------

    async fn initialize_work(
        &self,
        ctx: &TurnContext<'_>,
        args: JsonValue,
        request_prompt: Option<&str>,
    ) -> HandlerOutcome {
        #[derive(Deserialize)]
        struct InitArgs {
            #[serde(default)]
            prompt: Option<String>,
        }
        let args: InitArgs = match serde_json::from_value(args) {
            Ok(args) => args,
            Err(e) => return HandlerOutcome::bad_args(e),
        };

        let prompt = {
            let unit = ctx.unit.lock().await;
            unit.shared
                .original_prompt
                .clone()
                .or_else(|| request_prompt.map(str::to_string))
                .or(args.prompt)
                .unwrap_or_default()
        };

        // Side-channel overrides land before any memory query so a
        // brand-new override affects this very pack.
        match ctx.memory.ingest_overrides(&ctx.config.overrides_dir) {
            Ok(ingested) if !ingested.is_empty() => {
                tracing::info!("ingested {} memory override(s)", ingested.len());
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("override ingestion failed: {e}"),
        }

        let attachments = match context_pack::ingest_inbox(ctx.config, &ctx.ids.work_id) {
            Ok(attachments) => attachments,
            Err(e) => {
                tracing::warn!("inbox ingestion failed: {e}");
                Vec::new()
            }
        };

        // Query memories for the anchors the prompt points at.
        let lexemes = retrieval::lexemes_of(&prompt);
        let candidate_files: Vec<String> = ctx
            .index
            .lexical_candidates(&lexemes)
            .into_iter()
            .map(|(file, _)| file)
            .collect();
        let anchors = retrieval::derive_anchors(&candidate_files);
        let memories = ctx.memory.active_for_anchors(&anchors);

        let built = context_pack::build_pack(PackInputs {
            config: ctx.config,
            work_id: &ctx.ids.work_id,
            prompt: &prompt,
            memories,
            attachments,
            index: ctx.index,
            graph: ctx.graph,
            fetchers: ctx.fetchers,
            glossary: ctx.glossary,
        })
        .await;
        let mut pack = match built {
            Ok(pack) => pack,
            Err(e) => {
                tracing::error!("pack build failed: {e}");
                return HandlerOutcome::deny_with(
                    DenyCode::PackInsufficient,
                    json!({"error": e.to_string()}),
                );
            }
        };

        // Re-initialization must not shrink the allow-list.
        {
            let unit = ctx.unit.lock().await;
            if let Some(existing) = &unit.shared.pack {
                for file in existing.files.as_slice() {
                    pack.files.push(file.clone());
                }
                if pack.seal().is_err() {
                    return HandlerOutcome::deny_with(
                        DenyCode::PackInsufficient,
                        json!({"error": "failed to reseal pack"}),
                    );
                }
            }
        }

        if let Err(insufficiency) = pack.readiness() {
            let mut outcome = HandlerOutcome::deny_with(
                DenyCode::PackInsufficient,
                json!({"packInsufficient": true, "missingAnchors": insufficiency.missing_anchors}),
            );
            outcome.suggested_action = Some("escalate".to_string());
            outcome.pack_insufficiency = Some(insufficiency);
            return outcome;
        }

        let pack_path = ctx.config.pack_path(&ctx.ids.work_id);
        if let Err(e) = pack.write_atomic(&pack_path) {
            tracing::error!("failed to write context pack: {e}");
            return HandlerOutcome::deny_with(
                DenyCode::PackInsufficient,
                json!({"error": e.to_string()}),
            );
        }

        let _ = ctx
            .events
            .append(
                EventKind::RetrievalTrace,
                &ctx.ids.run_session_id,
                &ctx.ids.work_id,
                &ctx.ids.agent_id,
                json!({
                    "strategyId": pack.strategy_id,
                    "signature": pack.signature,
                    "decisions": pack.retrieval_trace.len(),
                    "queryExpansion": pack.query_expansion,
                    "traceRef": ctx.trace_ref,
                }),
            )
            .await;

        let result = json!({
            "packRef": pack_path,
            "packHash": pack.hash,
            "files": pack.files.as_slice(),
            "symbolCount": pack.symbols.len(),
            "strategyId": pack.strategy_id,
            "signature": pack.signature,
            "attachments": pack.attachments.len(),
        });

        {
            let mut unit = ctx.unit.lock().await;
            unit.shared.pack = Some(pack);
        }

        let mut outcome = HandlerOutcome::ok(result);
        outcome.state_override = Some(SessionState::Planning);
        outcome
    }

    async fn submit_execution_plan(
        &self,
        ctx: &TurnContext<'_>,
        args: JsonValue,
    ) -> HandlerOutcome {
        #[derive(Deserialize)]
        struct SubmitArgs {
            plan: PlanDocument,
        }
        let args: SubmitArgs = match serde_json::from_value(args) {
            Ok(args) => args,
            Err(e) => return HandlerOutcome::bad_args(e),
        };

        let mut unit = ctx.unit.lock().await;
        let Some(pack) = &unit.shared.pack else {
            return HandlerOutcome::deny_with(DenyCode::PackInsufficient, json!({}));
        };

        // The ephemeral enforcement bundle: memory plan rules + graph
        // policy rules, built fresh for this submission.
        let bundle = build_enforcement_bundle(&pack.memories, ctx.graph);
        let scratch_root = ctx.config.scratch_dir(&ctx.ids.work_id);
        let codes = plan_validator::validate_plan(ValidationInput {
            plan: &args.plan,
            pack,
            bundle: &bundle,
            worktree_root: &ctx.config.worktree_root,
            scratch_root: &scratch_root,
        });

        if !codes.is_empty() {
            let mut outcome = HandlerOutcome {
                result: json!({"accepted": false, "planId": args.plan.plan_id}),
                deny: codes,
                state_override: None,
                suggested_action: Some("fix every reported code and resubmit".to_string()),
                pack_insufficiency: None,
            };
            outcome.result["codes"] =
                json!(outcome.deny.iter().map(|c| c.to_string()).collect::<Vec<_>>());
            return outcome;
        }

        let plan_id = args.plan.plan_id.clone();
        unit.shared.accept_plan(args.plan);
        let progress = unit.shared.progress();

        let mut outcome = HandlerOutcome::ok(json!({
            "accepted": true,
            "planId": plan_id,
            "progress": progress,
        }));
        outcome.state_override = Some(SessionState::PlanAccepted);
        outcome
    }

    async fn escalate(&self, ctx: &TurnContext<'_>, args: JsonValue) -> HandlerOutcome {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct EscalateArgs {
            need: String,
            #[serde(default)]
            requested_evidence: Vec<RequestedEvidence>,
        }
        let args: EscalateArgs = match serde_json::from_value(args) {
            Ok(args) => args,
            Err(e) => return HandlerOutcome::bad_args(e),
        };

        let mut unit = ctx.unit.lock().await;
        let Some(pack) = unit.shared.pack.as_mut() else {
            let mut outcome = HandlerOutcome::deny_with(
                DenyCode::PackInsufficient,
                json!({"need": args.need}),
            );
            outcome.suggested_action = Some("initialize_work".to_string());
            return outcome;
        };

        let delta = match context_pack::enrich_pack(
            pack,
            &args.need,
            &args.requested_evidence,
            ctx.index,
            ctx.graph,
        ) {
            Ok(delta) => delta,
            Err(e) => {
                tracing::error!("pack enrichment failed: {e}");
                return HandlerOutcome::deny_with(
                    DenyCode::PackInsufficient,
                    json!({"error": e.to_string()}),
                );
            }
        };

        let pack_path = ctx.config.pack_path(&ctx.ids.work_id);
        if let Err(e) = pack.write_atomic(&pack_path) {
            tracing::error!("failed to rewrite context pack: {e}");
            return HandlerOutcome::deny_with(
                DenyCode::PackInsufficient,
                json!({"error": e.to_string()}),
            );
        }
        let file_count = pack.files.len();
        drop(unit);

        let _ = ctx
            .events
            .append(
                EventKind::PackEnriched,
                &ctx.ids.run_session_id,
                &ctx.ids.work_id,
                &ctx.ids.agent_id,
                json!({
                    "need": args.need,
                    "addedFiles": delta.added_files,
                    "newHash": delta.new_hash,
                    "traceRef": ctx.trace_ref,
                }),
            )
            .await;

        HandlerOutcome::ok(json!({
            "need": args.need,
            "delta": delta,
            "fileCount": file_count,
        }))
    }

    async fn signal_task_complete(
        &self,
        ctx: &TurnContext<'_>,
        args: JsonValue,
    ) -> HandlerOutcome {
        #[derive(Deserialize)]
        struct CompleteArgs {
            #[serde(default)]
            outcome: Option<String>,
        }
        let args: CompleteArgs = match serde_json::from_value(args) {
            Ok(args) => args,
            Err(e) => return HandlerOutcome::bad_args(e),
        };

        let unit = ctx.unit.lock().await;
        let state = unit.shared.state();
        if state.is_terminal() {
            return HandlerOutcome::ok(json!({"state": state, "alreadyTerminal": true}));
        }

        if args.outcome.as_deref() == Some("failed") {
            let mut outcome = HandlerOutcome::ok(json!({"finalState": "FAILED"}));
            outcome.state_override = Some(SessionState::Failed);
            return outcome;
        }

        // Completion gate: every node completed, every validation passed.
        let progress = unit.shared.progress();
        if progress.remaining > 0 {
            let mut outcome = HandlerOutcome::deny_with(
                DenyCode::PlanVerificationWeak,
                json!({
                    "remaining": progress.remaining,
                    "pendingValidations": progress.pending_validations,
                }),
            );
            outcome.suggested_action =
                Some("complete every plan node before signalling".to_string());
            return outcome;
        }

        let mut outcome = HandlerOutcome::ok(json!({
            "finalState": "COMPLETED",
            "progress": progress,
        }));
        outcome.state_override = Some(SessionState::Completed);
        outcome
    }

    // -----------------------------------------------------------------
    // Post-dispatch lanes
    // -----------------------------------------------------------------

    /// Count rejections per agent; at the configured threshold, scaffold a
    /// pending memory candidate once per code.
    async fn track_friction(&self, ctx: &TurnContext<'_>, deny: &[DenyCode]) {
        if deny.is_empty() {
            return;
        }
        let mut reached: Vec<String> = Vec::new();
        let anchors = {
            let mut unit = ctx.unit.lock().await;
            let threshold = self.config.friction_threshold;
            let agent = unit.agent_mut(&ctx.ids.agent_id);
            for code in deny {
                let code = code.to_string();
                let count = agent.rejection_counts.entry(code.clone()).or_insert(0);
                *count += 1;
                if *count >= threshold && !agent.corrections_emitted.contains(&code) {
                    agent.corrections_emitted.insert(code.clone());
                    reached.push(code);
                }
            }
            if reached.is_empty() {
                return;
            }
            unit.shared
                .pack
                .as_ref()
                .map(|p| retrieval::derive_anchors(p.files.as_slice()))
                .unwrap_or_default()
        };

        for code in reached {
            match self
                .memory
                .scaffold_friction_candidate(&code, anchors.clone(), ctx.trace_ref)
            {
                Ok(record) => {
                    let _ = self
                        .events
                        .append(
                            EventKind::PendingCorrectionCreated,
                            &ctx.ids.run_session_id,
                            &ctx.ids.work_id,
                            &ctx.ids.agent_id,
                            json!({
                                "rejectionCode": code,
                                "memoryId": record.id,
                                "traceRef": ctx.trace_ref,
                            }),
                        )
                        .await;
                }
                Err(e) => tracing::error!("failed to scaffold friction candidate: {e}"),
            }
        }
    }

    /// Promote pending records whose contest window has elapsed.
    async fn run_promotion_lane(&self, ids: &ResolvedIds) {
        let promoted = match self.memory.promote_elapsed(self.config.contest_window_hours) {
            Ok(promoted) => promoted,
            Err(e) => {
                tracing::error!("promotion lane failed: {e}");
                return;
            }
        };
        for (memory_id, trigger) in promoted {
            let _ = self
                .events
                .append(
                    EventKind::MemoryPromotionTransition,
                    &ids.run_session_id,
                    &ids.work_id,
                    &ids.agent_id,
                    json!({
                        "memoryId": memory_id,
                        "from": "pending",
                        "to": "provisional",
                        "trigger": trigger,
                    }),
                )
                .await;
        }
    }

    // -----------------------------------------------------------------
    // Envelope assembly
    // -----------------------------------------------------------------

    async fn assemble_envelope(
        &self,
        ids: &ResolvedIds,
        unit: &Arc<tokio::sync::Mutex<WorkUnit>>,
        outcome: HandlerOutcome,
        used_tokens: u64,
        trace_ref: &str,
    ) -> ResponseEnvelope {
        let unit = unit.lock().await;
        let shared = &unit.shared;
        let state = shared.state();
        let progress = shared.progress();

        let knowledge_strategy = match &shared.pack {
            Some(pack) => KnowledgeStrategy {
                id: pack.strategy_id.clone(),
                reasons: pack.strategy_reasons.clone(),
                context_signature: Some(pack.signature),
            },
            None => KnowledgeStrategy {
                id: "unconfigured".to_string(),
                reasons: vec!["no context pack sealed yet".to_string()],
                context_signature: None,
            },
        };

        let suggested_action = outcome
            .suggested_action
            .or_else(|| default_suggested_action(state, &progress));

        ResponseEnvelope {
            run_session_id: ids.run_session_id.clone(),
            work_id: ids.work_id.clone(),
            agent_id: ids.agent_id.clone(),
            state,
            outcome: Some(if outcome.deny.is_empty() {
                TurnOutcome::Ok
            } else {
                TurnOutcome::Denied
            }),
            capabilities: capability::capabilities_for(state),
            verb_descriptions: capability::verb_descriptions(),
            scope: ScopeInfo {
                worktree_root: self.config.worktree_root.clone(),
                scratch_root: self.config.scratch_dir(&ids.work_id),
            },
            result: outcome.result,
            deny_reasons: outcome.deny,
            suggested_action,
            knowledge_strategy,
            budget_status: BudgetStatus {
                max: self.config.max_tokens,
                used: used_tokens,
                threshold: self.config.threshold_tokens,
                blocked: state == SessionState::BlockedBudget,
            },
            trace_ref: trace_ref.to_string(),
            schema_version: ENVELOPE_SCHEMA_VERSION.to_string(),
            sub_agent_hints: sub_agent_hints(shared.plan.as_ref()),
            progress,
            pack_insufficiency: outcome.pack_insufficiency,
            original_prompt: shared.original_prompt.clone(),
        }
    }
}

fn default_suggested_action(state: SessionState, progress: &ProgressSummary) -> Option<String> {
    match state {
        SessionState::Uninitialized => Some("initialize_work".to_string()),
        SessionState::Planning => Some("submit_execution_plan".to_string()),
        SessionState::PlanAccepted if progress.remaining > 0 => {
            Some("execute the remaining plan nodes".to_string())
        }
        SessionState::PlanAccepted => Some("signal_task_complete".to_string()),
        SessionState::BlockedBudget => Some("escalate".to_string()),
        SessionState::Completed | SessionState::Failed => None,
    }
}

/// Splitting hints: recommended once several independent change nodes
/// exist; splits suggested along atomicity-boundary modules.
fn sub_agent_hints(plan: Option<&PlanDocument>) -> SubAgentHints {
    let Some(plan) = plan else {
        return SubAgentHints::default();
    };
    let change_nodes: Vec<_> = plan
        .nodes
        .iter()
        .filter(|n| n.kind == PlanNodeKind::Change)
        .collect();
    let independent = change_nodes
        .iter()
        .filter(|n| n.depends_on.is_empty())
        .count();
    let mut suggested_splits: Vec<String> = Vec::new();
    for node in &change_nodes {
        if let Some(boundary) = &node.atomicity_boundary {
            for module in &boundary.modules {
                if !suggested_splits.contains(module) {
                    suggested_splits.push(module.clone());
                }
            }
        }
    }
    SubAgentHints {
        recommended: independent >= 3,
        suggested_splits,
    }
}
