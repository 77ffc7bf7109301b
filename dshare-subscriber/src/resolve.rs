//! Lazy expression resolver
//!
//! Resolving a derived dataset ensures the chunks of every operand, then
//! returns a handle that evaluates the expression from local data only.
//! Operands of one expression are ensured concurrently; nested expressions
//! are resolved recursively before their own operands are read. A path that
//! reappears among its own ancestors is a cycle and fails the resolve.
//!
//! An operand either has the expression's shape or holds a single element,
//! which broadcasts. Any other shape fails before anything is downloaded.

use dshare_core::{Container, DatasetMeta, DatasetPath, Expr, LazyExprMeta, NdArray, Slice};
use futures::future::{BoxFuture, FutureExt, try_join_all};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::fetch::{FetchEngine, FetchReport};
use crate::unblock;

/// An operand as seen by a resolved expression
#[derive(Debug)]
enum Operand {
    Stored(Container),
    Lazy(ComputableHandle),
}

/// A lazy expression whose operand chunks are present locally
#[derive(Debug)]
pub struct ComputableHandle {
    path: DatasetPath,
    meta: LazyExprMeta,
    expr: Expr,
    operands: BTreeMap<String, Operand>,
    fetched: Vec<FetchReport>,
}

impl ComputableHandle {
    pub fn path(&self) -> &DatasetPath {
        &self.path
    }

    pub fn meta(&self) -> &LazyExprMeta {
        &self.meta
    }

    pub fn shape(&self) -> &[u64] {
        &self.meta.shape
    }

    /// Fetch reports of every stored operand ensured for this handle,
    /// nested operands included
    pub fn fetch_reports(&self) -> Vec<&FetchReport> {
        let mut out: Vec<&FetchReport> = self.fetched.iter().collect();
        for op in self.operands.values() {
            if let Operand::Lazy(inner) = op {
                out.extend(inner.fetch_reports());
            }
        }
        out
    }

    /// Evaluate the expression over `slice` (the whole shape for `None`)
    ///
    /// Operands whose shape equals the expression's are read through the
    /// same slice; a single-element operand is read whole. The result is
    /// float64.
    pub fn evaluate(&self, slice: Option<&Slice>) -> Result<NdArray> {
        let full = Slice::full(&self.meta.shape);
        let slice = slice.unwrap_or(&full);
        let mut values = BTreeMap::new();
        for (name, op) in &self.operands {
            let value = match op {
                Operand::Stored(container) => {
                    let op_slice = operand_slice(&container.shape(), &self.meta.shape, Some(slice))
                        .unwrap_or_else(|| Slice::full(&container.shape()));
                    container.read_slice(&op_slice)?
                }
                Operand::Lazy(inner) => {
                    let op_slice = operand_slice(inner.shape(), &self.meta.shape, Some(slice));
                    inner.evaluate(op_slice.as_ref())?
                }
            };
            values.insert(name.clone(), value);
        }
        Ok(self.expr.evaluate(&values, &slice.shape())?)
    }
}

/// Slice to request from an operand of shape `operand` under an expression
/// of shape `expr`: the expression's own slice when the shapes agree
fn operand_slice(operand: &[u64], expr: &[u64], slice: Option<&Slice>) -> Option<Slice> {
    if operand == expr { slice.cloned() } else { None }
}

pub struct Resolver {
    engine: Arc<FetchEngine>,
}

impl Resolver {
    pub fn new(engine: Arc<FetchEngine>) -> Self {
        Self { engine }
    }

    /// Ensure every chunk `slice` of `path` depends on and return a handle
    pub async fn resolve(&self, path: &DatasetPath, slice: Option<&Slice>) -> Result<ComputableHandle> {
        self.resolve_inner(path.clone(), slice.cloned(), Vec::new()).await
    }

    fn resolve_inner(
        &self,
        path: DatasetPath,
        slice: Option<Slice>,
        ancestors: Vec<DatasetPath>,
    ) -> BoxFuture<'_, Result<ComputableHandle>> {
        async move {
            let container = self.engine.open_placeholder(&path).await?;
            let meta = match container.meta() {
                DatasetMeta::LazyExpr(m) => m.clone(),
                other => {
                    return Err(SyncError::Store(dshare_core::Error::Expression(format!(
                        "{} is a {} dataset, not a lazy expression",
                        path,
                        other.kind_name()
                    ))));
                }
            };
            let expr = Expr::parse(&meta.expression)?;
            for var in expr.variables() {
                if !meta.operands.contains_key(var) {
                    return Err(SyncError::Store(dshare_core::Error::Expression(format!(
                        "{}: variable {} has no operand",
                        path, var
                    ))));
                }
            }

            let mut chain = ancestors;
            chain.push(path.clone());

            let tasks = meta.operands.iter().map(|(name, target)| {
                let chain = chain.clone();
                let slice = slice.clone();
                let path = &path;
                let meta = &meta;
                async move {
                    let target = DatasetPath::parse(target)?;
                    if chain.contains(&target) {
                        let cycle: Vec<String> = chain.iter().map(|p| p.to_string()).collect();
                        return Err(SyncError::ExpressionCycle(format!(
                            "{} -> {}",
                            cycle.join(" -> "),
                            target
                        )));
                    }
                    let op = self
                        .resolve_operand(&target, &meta.shape, slice.as_ref(), chain)
                        .await
                        .map_err(|e| missing_operand(e, path, &target))?;
                    Ok::<_, SyncError>((name.clone(), op))
                }
            });
            let resolved = try_join_all(tasks).await?;

            let mut operands = BTreeMap::new();
            let mut fetched = Vec::new();
            for (name, (op, report)) in resolved {
                if let Some(report) = report {
                    fetched.push(report);
                }
                operands.insert(name, op);
            }

            tracing::debug!("Resolved {} ({} operands)", path, operands.len());
            Ok(ComputableHandle {
                path,
                meta,
                expr,
                operands,
                fetched,
            })
        }
        .boxed()
    }

    async fn resolve_operand(
        &self,
        target: &DatasetPath,
        expr_shape: &[u64],
        slice: Option<&Slice>,
        chain: Vec<DatasetPath>,
    ) -> Result<(Operand, Option<FetchReport>)> {
        let container: Container = self.engine.open_placeholder(target).await?;
        let shape = container.shape();
        if shape != expr_shape && !shape.iter().all(|&d| d == 1) {
            return Err(SyncError::Store(dshare_core::Error::Expression(format!(
                "operand {} has shape {:?}, expression has shape {:?}",
                target, shape, expr_shape
            ))));
        }
        let op_slice = operand_slice(&shape, expr_shape, slice);
        if let DatasetMeta::LazyExpr(_) = container.meta() {
            let inner = self.resolve_inner(target.clone(), op_slice, chain).await?;
            return Ok((Operand::Lazy(inner), None));
        }
        if target.is_scratch() {
            // scratch data is never fetched; it must already be complete
            let missing = {
                let container = container.clone();
                unblock(move || container.missing_chunks()).await?
            };
            if let Some(&index) = missing.first() {
                return Err(SyncError::Store(dshare_core::Error::ChunkAbsent {
                    path: target.to_string(),
                    index,
                }));
            }
            return Ok((Operand::Stored(container), None));
        }
        let (container, report) = self.engine.ensure_open(target, op_slice.as_ref()).await?;
        Ok((Operand::Stored(container), Some(report)))
    }
}

/// Not-found errors of an operand become missing-operand errors of the
/// expression; everything else passes through
fn missing_operand(e: SyncError, expression: &DatasetPath, operand: &DatasetPath) -> SyncError {
    match e {
        e if e.is_not_found() => SyncError::MissingOperand {
            expression: expression.to_string(),
            operand: operand.to_string(),
        },
        SyncError::UnknownRoot(_) => SyncError::MissingOperand {
            expression: expression.to_string(),
            operand: operand.to_string(),
        },
        other => other,
    }
}
